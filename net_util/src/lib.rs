// Copyright © 2024 The vmcli Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Network addressing types shared by the configuration layer and the
//! hypervisor backends.

mod mac;

pub use mac::{MacAddr, MacAddrParseError};
