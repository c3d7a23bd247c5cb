// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Registration of vhost backend types.
//!
//! Every registered backend type is published as a node on the general control surface. A
//! backend type able to have its queues started and stopped by an in-process front-end is also
//! published as `<name>-kernel` on the privileged surface. Opening a node creates a new
//! backend instance and returns a [VhostFile](struct.VhostFile.html) handle to it.

use std::any::Any;
use std::collections::btree_map::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info};

use crate::{
    Error, OwnerId, Result, VhostDev, VhostDevState, VhostRequest, VhostVirtqueue, VqsGuard,
};

/// Suffix appended to the backend name for the privileged surface node.
pub const KERNEL_NODE_SUFFIX: &str = "-kernel";

/// Operations implemented by a vhost backend type.
pub trait VhostOps: Send + Sync {
    /// Name of the general surface node.
    fn name(&self) -> &str;

    /// Number of virtqueues of each instance.
    fn num_queues(&self) -> usize;

    /// Largest queue size the backend can process.
    fn max_queue_size(&self) -> u32 {
        1024
    }

    /// Feature bits offered to the driver.
    fn features(&self) -> u64;

    /// Creates the private state of a new instance.
    fn open(&self) -> Result<Box<dyn Any + Send>>;

    /// Handles a request specific to the backend type.
    fn ioctl(
        &self,
        _state: &mut VhostDevState,
        _vqs: &mut VqsGuard,
        _code: u32,
        _index: u32,
        _value: u64,
    ) -> Result<u64> {
        Err(Error::Unsupported)
    }

    /// Tears down the private state of an instance.
    ///
    /// Called once, when the last reference to the instance is dropped, after every started
    /// queue has been stopped.
    fn release(&self, _state: &mut VhostDevState) {}

    /// Whether an in-process front-end can start and stop the queues.
    fn supports_queue_control(&self) -> bool {
        false
    }

    /// Starts processing a queue.
    fn start_vq(
        &self,
        _state: &mut VhostDevState,
        _vq: &mut VhostVirtqueue,
        _index: u32,
    ) -> Result<()> {
        Err(Error::Unsupported)
    }

    /// Stops processing a queue.
    fn stop_vq(&self, _state: &mut VhostDevState, _vq: &mut VhostVirtqueue, _index: u32) {}
}

/// Control surface a node belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfaceKind {
    /// Ordinary control surface.
    General,
    /// Control surface handing instances to in-process front-ends.
    Privileged,
}

struct Node {
    ops: Arc<dyn VhostOps>,
    kind: SurfaceKind,
}

/// Registry of published backend nodes.
#[derive(Default)]
pub struct VhostRegistry {
    nodes: Mutex<BTreeMap<String, Node>>,
    next_instance: AtomicU64,
}

impl VhostRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        VhostRegistry::default()
    }

    fn nodes(&self) -> MutexGuard<BTreeMap<String, Node>> {
        // Safe to unwrap() because we don't expect poisoned lock here.
        self.nodes.lock().unwrap()
    }

    /// Publishes a backend type.
    pub fn register_backend(&self, ops: Arc<dyn VhostOps>) -> Result<()> {
        let name = ops.name().to_string();
        if name.is_empty() || ops.num_queues() == 0 {
            return Err(Error::InvalidConfig);
        }
        let kernel_name = format!("{}{}", name, KERNEL_NODE_SUFFIX);

        let mut nodes = self.nodes();
        if nodes.contains_key(&name)
            || (ops.supports_queue_control() && nodes.contains_key(&kernel_name))
        {
            return Err(Error::Busy);
        }

        if ops.supports_queue_control() {
            nodes.insert(
                kernel_name.clone(),
                Node {
                    ops: ops.clone(),
                    kind: SurfaceKind::Privileged,
                },
            );
            info!("vhost: published {}", kernel_name);
        }
        nodes.insert(
            name.clone(),
            Node {
                ops,
                kind: SurfaceKind::General,
            },
        );
        info!("vhost: published {}", name);

        Ok(())
    }

    /// Removes the nodes of a backend type.
    ///
    /// Instances already opened stay valid until their last handle is dropped.
    pub fn unregister_backend(&self, name: &str) -> Result<()> {
        let mut nodes = self.nodes();
        match nodes.get(name) {
            Some(node) if node.kind == SurfaceKind::General => {}
            _ => return Err(Error::NoDevice(name.to_string())),
        }
        nodes.remove(name);
        let kernel_name = format!("{}{}", name, KERNEL_NODE_SUFFIX);
        if matches!(nodes.get(&kernel_name), Some(n) if n.kind == SurfaceKind::Privileged) {
            nodes.remove(&kernel_name);
        }
        info!("vhost: unpublished {}", name);

        Ok(())
    }

    /// Opens a node, creating a new backend instance.
    pub fn open(&self, node: &str) -> Result<VhostFile> {
        let (ops, kind) = {
            let nodes = self.nodes();
            let n = nodes
                .get(node)
                .ok_or_else(|| Error::NoDevice(node.to_string()))?;
            (n.ops.clone(), n.kind)
        };
        let id = format!(
            "{}.{}",
            node,
            self.next_instance.fetch_add(1, Ordering::Relaxed)
        );
        let dev = VhostDev::new(id, ops)?;
        debug!("vhost: opened {} on {:?} surface", dev.id(), kind);

        Ok(VhostFile(Arc::new(VhostFileInner { dev, kind })))
    }

    /// Names of the published nodes, in order.
    pub fn node_names(&self) -> Vec<String> {
        self.nodes().keys().cloned().collect()
    }
}

struct VhostFileInner {
    dev: VhostDev,
    kind: SurfaceKind,
}

/// Handle to an opened backend instance.
///
/// Cloning the handle takes another reference to the same instance. The instance is released
/// when the last reference is dropped.
#[derive(Clone)]
pub struct VhostFile(Arc<VhostFileInner>);

impl VhostFile {
    /// Control surface the handle was opened on.
    pub fn kind(&self) -> SurfaceKind {
        self.0.kind
    }

    /// The backend instance.
    pub fn dev(&self) -> &VhostDev {
        &self.0.dev
    }

    /// Number of references to the instance.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Issues a control request on the instance.
    ///
    /// The privileged surface never forwards queue-shaping requests and refuses everything once
    /// the instance has been claimed by an in-process front-end. The claim is never dropped, so
    /// a fresh instance must be opened to configure it again.
    pub fn ioctl(&self, caller: OwnerId, req: VhostRequest) -> Result<u64> {
        let dev = &self.0.dev;
        match self.0.kind {
            SurfaceKind::General => dev.ioctl(caller, req),
            SurfaceKind::Privileged => {
                if req.is_queue_shaping() {
                    return Err(Error::PermissionDenied);
                }
                let mut state = dev.state();
                if state.kernel_attached {
                    return Err(Error::PermissionDenied);
                }
                dev.handle_request(&mut state, caller, req)
            }
        }
    }
}

impl fmt::Debug for VhostFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VhostFile")
            .field("id", &self.0.dev.id())
            .field("kind", &self.0.kind)
            .finish()
    }
}
