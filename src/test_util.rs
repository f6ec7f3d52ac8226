// Copyright © 2025 Cyberus Technology GmbH
//
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright © 2024 The vmcli Authors
//

#[cfg(test)]
pub mod tests {
    use clap::Command;

    /// Checks that the arguments of `cmd` are declared in alphabetical
    /// order of their ids.
    pub fn assert_args_sorted(cmd: &Command) {
        let ids: Vec<&str> = cmd.get_arguments().map(|arg| arg.get_id().as_str()).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();

        assert_eq!(ids, sorted, "args not alphabetically sorted");
    }
}
