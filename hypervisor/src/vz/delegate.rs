// Copyright © 2024 The vmcli Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::mpsc::Sender;

use log::debug;
use objc2::rc::Retained;
use objc2::runtime::NSObject;
use objc2::{define_class, msg_send, AllocAnyThread, DefinedClass};
use objc2_foundation::{NSError, NSObjectProtocol};
use objc2_virtualization::{VZNetworkDevice, VZVirtualMachine, VZVirtualMachineDelegate};

use crate::vm::VmEvent;

pub struct Ivars {
    events: Sender<VmEvent>,
}

define_class!(
    // SAFETY:
    // - The superclass NSObject does not have any subclassing requirements.
    // - `VmDelegate` does not implement `Drop`.
    #[unsafe(super(NSObject))]
    #[name = "VmcliVirtualMachineDelegate"]
    #[ivars = Ivars]
    pub struct VmDelegate;

    unsafe impl NSObjectProtocol for VmDelegate {}

    unsafe impl VZVirtualMachineDelegate for VmDelegate {
        #[unsafe(method(guestDidStopVirtualMachine:))]
        fn guest_did_stop(&self, _virtual_machine: &VZVirtualMachine) {
            self.notify(VmEvent::GuestStopped);
        }

        #[unsafe(method(virtualMachine:didStopWithError:))]
        fn did_stop_with_error(&self, _virtual_machine: &VZVirtualMachine, error: &NSError) {
            self.notify(VmEvent::StoppedWithError(
                error.localizedDescription().to_string(),
            ));
        }

        #[unsafe(method(virtualMachine:networkDevice:attachmentWasDisconnectedWithError:))]
        fn attachment_was_disconnected(
            &self,
            _virtual_machine: &VZVirtualMachine,
            network_device: &VZNetworkDevice,
            error: &NSError,
        ) {
            self.notify(VmEvent::NetworkDisconnected {
                device: network_device.description().to_string(),
                detail: error.localizedDescription().to_string(),
            });
        }
    }
);

impl VmDelegate {
    pub fn new(events: Sender<VmEvent>) -> Retained<Self> {
        let this = Self::alloc().set_ivars(Ivars { events });
        // SAFETY: NSObject's init has no requirements.
        unsafe { msg_send![super(this), init] }
    }

    fn notify(&self, event: VmEvent) {
        debug!("Virtual machine event: {event:?}");
        // Sending fails once the controller dropped its receiver.
        let _ = self.ivars().events.send(event);
    }
}
