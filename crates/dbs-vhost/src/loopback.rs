// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Loopback backend type.
//!
//! The loopback backend does not look at descriptor chains. Each kick on a started queue is
//! consumed and answered with a call on the same queue, which is enough to exercise the
//! notification path of a front-end end to end. Every start and stop is recorded.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, warn};

use crate::{
    Error, EventSignal, Result, VhostDevState, VhostOps, VhostVirtqueue, VqsGuard, WaitToken,
    SIGNAL_IN, VIRTIO_F_ACCESS_PLATFORM, VIRTIO_F_VERSION_1,
};

/// Name of the loopback backend node.
pub const VHOST_LOOPBACK_NAME: &str = "vhost-loopback";
/// Binds (non-zero value) or unbinds (zero) a transfer on a queue.
pub const VHOST_LOOPBACK_SET_BACKEND: u32 = 0x30;

/// Ring layout a queue was started with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VringStart {
    /// Queue index.
    pub index: u32,
    /// Descriptor table address.
    pub desc: u64,
    /// Available ring address.
    pub avail: u64,
    /// Used ring address.
    pub used: u64,
    /// Queue size.
    pub num: u32,
    /// Next available index.
    pub base: u16,
}

struct KickBinding {
    kick: Arc<EventSignal>,
    token: WaitToken,
}

/// Private state of a loopback instance.
pub struct LoopbackState {
    bindings: Vec<Option<KickBinding>>,
    starts: Vec<VringStart>,
    stops: Vec<u32>,
    echoed: Arc<AtomicU64>,
}

impl LoopbackState {
    /// Gets the loopback state of an instance, if it is a loopback instance.
    pub fn from_dev_state(state: &VhostDevState) -> Option<&LoopbackState> {
        state.private.downcast_ref::<LoopbackState>()
    }

    /// Every queue start, oldest first.
    pub fn starts(&self) -> &[VringStart] {
        &self.starts
    }

    /// Every queue stop, oldest first.
    pub fn stops(&self) -> &[u32] {
        &self.stops
    }

    /// Number of kicks answered with a call.
    pub fn echoed(&self) -> u64 {
        self.echoed.load(Ordering::Acquire)
    }

    fn unbind(&mut self, index: usize) {
        if let Some(b) = self.bindings.get_mut(index).and_then(Option::take) {
            b.kick.remove_waiter(b.token);
        }
    }
}

fn echo(kick: &EventSignal, call: &EventSignal, echoed: &AtomicU64) {
    match kick.consume() {
        Ok(0) => return,
        Ok(_) => {}
        Err(e) => {
            warn!("vhost-loopback: failed to consume kick, {}", e);
            return;
        }
    }
    echoed.fetch_add(1, Ordering::AcqRel);
    if let Err(e) = call.signal(1) {
        warn!("vhost-loopback: failed to signal call, {}", e);
    }
}

/// Loopback backend type.
pub struct VhostLoopback {
    name: String,
    num_queues: usize,
}

impl VhostLoopback {
    /// Creates a loopback backend type publishing `name` with `num_queues` queues.
    pub fn new(name: &str, num_queues: usize) -> Self {
        VhostLoopback {
            name: name.to_string(),
            num_queues,
        }
    }

    fn private<'a>(&self, state: &'a mut VhostDevState) -> Result<&'a mut LoopbackState> {
        state
            .private
            .downcast_mut::<LoopbackState>()
            .ok_or(Error::InvalidState)
    }
}

impl Default for VhostLoopback {
    fn default() -> Self {
        VhostLoopback::new(VHOST_LOOPBACK_NAME, 2)
    }
}

impl VhostOps for VhostLoopback {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_queues(&self) -> usize {
        self.num_queues
    }

    fn features(&self) -> u64 {
        (1u64 << VIRTIO_F_VERSION_1) | (1u64 << VIRTIO_F_ACCESS_PLATFORM)
    }

    fn open(&self) -> Result<Box<dyn Any + Send>> {
        Ok(Box::new(LoopbackState {
            bindings: (0..self.num_queues).map(|_| None).collect(),
            starts: Vec::new(),
            stops: Vec::new(),
            echoed: Arc::new(AtomicU64::new(0)),
        }))
    }

    fn ioctl(
        &self,
        _state: &mut VhostDevState,
        vqs: &mut VqsGuard,
        code: u32,
        index: u32,
        value: u64,
    ) -> Result<u64> {
        match code {
            VHOST_LOOPBACK_SET_BACKEND => {
                let vq = vqs.get_mut(index)?;
                if value != 0 {
                    vq.private_data = Some(Box::new(value));
                } else {
                    vq.private_data = None;
                }
                Ok(0)
            }
            _ => Err(Error::Unsupported),
        }
    }

    fn release(&self, state: &mut VhostDevState) {
        if let Ok(st) = self.private(state) {
            for i in 0..st.bindings.len() {
                st.unbind(i);
            }
        }
    }

    fn supports_queue_control(&self) -> bool {
        true
    }

    fn start_vq(&self, state: &mut VhostDevState, vq: &mut VhostVirtqueue, index: u32) -> Result<()> {
        let (kick, call) = match (vq.kick.as_ref(), vq.call.as_ref()) {
            (Some(kick), Some(call)) => (kick.clone(), call.clone()),
            _ => return Err(Error::InvalidState),
        };
        if vq.num == 0 {
            return Err(Error::InvalidConfig);
        }
        let st = self.private(state)?;
        st.unbind(index as usize);

        let weak_kick: Weak<EventSignal> = Arc::downgrade(&kick);
        let echo_call = call.clone();
        let echoed = st.echoed.clone();
        let token = kick.add_waiter(Box::new(move |flags| {
            if flags & SIGNAL_IN == 0 {
                return;
            }
            if let Some(kick) = weak_kick.upgrade() {
                echo(&kick, &echo_call, &echoed);
            }
        }));
        // Kicks raised before the queue was started.
        echo(&kick, &call, &st.echoed);

        if let Some(slot) = st.bindings.get_mut(index as usize) {
            *slot = Some(KickBinding { kick, token });
        }
        st.starts.push(VringStart {
            index,
            desc: vq.desc,
            avail: vq.avail,
            used: vq.used,
            num: vq.num,
            base: vq.last_avail_idx,
        });
        debug!("vhost-loopback: queue {} started, num {}", index, vq.num);

        Ok(())
    }

    fn stop_vq(&self, state: &mut VhostDevState, _vq: &mut VhostVirtqueue, index: u32) {
        if let Ok(st) = self.private(state) {
            st.unbind(index as usize);
            st.stops.push(index);
            debug!("vhost-loopback: queue {} stopped", index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OwnerId, VhostKernelDev, VhostRegistry, VhostRequest};

    struct Setup {
        _registry: VhostRegistry,
        file: crate::VhostFile,
        kicks: Vec<Arc<EventSignal>>,
        calls: Vec<Arc<EventSignal>>,
    }

    fn setup() -> Setup {
        let registry = VhostRegistry::new();
        registry
            .register_backend(Arc::new(VhostLoopback::default()))
            .unwrap();
        let file = registry.open("vhost-loopback-kernel").unwrap();
        let me = OwnerId::current();
        file.ioctl(me, VhostRequest::SetOwner).unwrap();
        file.ioctl(
            me,
            VhostRequest::SetFeatures(1u64 << VIRTIO_F_ACCESS_PLATFORM),
        )
        .unwrap();

        let mut kicks = Vec::new();
        let mut calls = Vec::new();
        for index in 0..2 {
            let kick = EventSignal::new().unwrap();
            let call = EventSignal::new().unwrap();
            file.ioctl(
                me,
                VhostRequest::SetVringKick {
                    index,
                    signal: Some(kick.clone()),
                },
            )
            .unwrap();
            file.ioctl(
                me,
                VhostRequest::SetVringCall {
                    index,
                    signal: Some(call.clone()),
                },
            )
            .unwrap();
            kicks.push(kick);
            calls.push(call);
        }

        Setup {
            _registry: registry,
            file,
            kicks,
            calls,
        }
    }

    #[test]
    fn test_set_backend() {
        let s = setup();
        let me = OwnerId::current();
        let bind = |index, value| {
            s.file.ioctl(
                me,
                VhostRequest::Device {
                    code: VHOST_LOOPBACK_SET_BACKEND,
                    index,
                    value,
                },
            )
        };

        assert!(matches!(bind(2, 1), Err(Error::InvalidIndex(2))));
        assert!(matches!(
            s.file.ioctl(
                me,
                VhostRequest::Device {
                    code: 0x99,
                    index: 0,
                    value: 0
                }
            ),
            Err(Error::Unsupported)
        ));
        bind(1, 7).unwrap();
        assert!(matches!(
            VhostKernelDev::get(&s.file, me),
            Err(Error::Busy)
        ));
        bind(1, 0).unwrap();
        VhostKernelDev::get(&s.file, me).unwrap();
    }

    #[test]
    fn test_kick_echo() {
        let s = setup();
        let kdev = VhostKernelDev::get(&s.file, OwnerId::current()).unwrap();

        // Not configured yet.
        assert!(matches!(kdev.start_vq(0), Err(Error::InvalidConfig)));

        kdev.set_num_addr(0, 0x1000, 0x2000, 0x3000).unwrap();
        kdev.set_vring_num(0, 256).unwrap();
        kdev.set_vring_base(0, 9).unwrap();
        s.kicks[0].signal(1).unwrap();
        kdev.start_vq(0).unwrap();
        // Pending kick answered on start.
        assert_eq!(s.calls[0].consume().unwrap(), 1);

        s.kicks[0].signal(1).unwrap();
        assert_eq!(s.calls[0].consume().unwrap(), 1);
        assert!(!s.kicks[0].poll());
        assert!(!s.calls[1].poll());

        kdev.stop_vq(0).unwrap();
        s.kicks[0].signal(1).unwrap();
        assert!(!s.calls[0].poll());
        assert_eq!(s.kicks[0].waiter_count(), 0);

        let state = s.file.dev().state();
        let st = LoopbackState::from_dev_state(&state).unwrap();
        assert_eq!(
            st.starts(),
            &[VringStart {
                index: 0,
                desc: 0x1000,
                avail: 0x2000,
                used: 0x3000,
                num: 256,
                base: 9,
            }]
        );
        assert_eq!(st.stops(), &[0]);
        assert_eq!(st.echoed(), 2);
    }

    #[test]
    fn test_release_stops_queues() {
        let s = setup();
        let kdev = VhostKernelDev::get(&s.file, OwnerId::current()).unwrap();
        kdev.set_vring_num(1, 64).unwrap();
        kdev.start_vq(1).unwrap();
        assert_eq!(s.kicks[1].waiter_count(), 1);

        drop(kdev);
        let Setup { file, kicks, .. } = s;
        drop(file);
        assert_eq!(kicks[1].waiter_count(), 0);
    }
}
