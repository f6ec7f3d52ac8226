// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright © 2024 The vmcli Authors
//

use std::fmt;
use std::result::Result;
use std::str::FromStr;

use serde::de::{Deserialize, Deserializer, Error};
use serde::ser::{Serialize, Serializer};
use thiserror::Error;

const MAC_ADDR_LEN: usize = 6;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MacAddrParseError {
    #[error("parsing of {0} into a MAC address failed")]
    InvalidValue(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MacAddr {
    bytes: [u8; MAC_ADDR_LEN],
}

impl MacAddr {
    /// Parses six two-digit hexadecimal groups separated uniformly by either
    /// `:` or `-`.
    pub fn parse_str<S>(s: &S) -> Result<MacAddr, MacAddrParseError>
    where
        S: AsRef<str> + ?Sized,
    {
        let s = s.as_ref();
        let common_err = || MacAddrParseError::InvalidValue(s.to_owned());

        let separator = if s.contains(':') { ':' } else { '-' };
        let v: Vec<&str> = s.split(separator).collect();
        if v.len() != MAC_ADDR_LEN {
            return Err(common_err());
        }

        let mut bytes = [0u8; MAC_ADDR_LEN];
        for (byte, group) in bytes.iter_mut().zip(v) {
            if group.len() != 2 || !group.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(common_err());
            }
            *byte = u8::from_str_radix(group, 16).map_err(|_| common_err())?;
        }

        Ok(MacAddr { bytes })
    }

}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let b = &self.bytes;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl Serialize for MacAddr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D>(deserializer: D) -> Result<MacAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        MacAddr::parse_str(&s)
            .map_err(|e| D::Error::custom(format!("The provided MAC address is invalid: {e}")))
    }
}

impl FromStr for MacAddr {
    type Err = MacAddrParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        MacAddr::parse_str(s)
    }
}
