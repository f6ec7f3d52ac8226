// Copyright © 2025 Cyberus Technology GmbH
//
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright © 2024 The vmcli Authors
//

use std::error::Error;

/// Returns the message of `top_error` followed by the message of each of its
/// sources, outermost first.
pub fn error_chain(top_error: &dyn Error) -> Vec<String> {
    std::iter::successors(Some(top_error), |sub_error| (*sub_error).source())
        .map(|error| error.to_string())
        .collect()
}

/// Prints a chain of errors to the user in a consistent manner.
/// The user will see a clear chain of errors, followed by debug output
/// for opening issues.
pub fn cli_print_error_chain(top_error: &dyn Error, component: &str) {
    let chain = error_chain(top_error);

    eprint!("Error: {component} exited with the following ");
    if let [error] = chain.as_slice() {
        eprintln!("error:");
        eprintln!("  {error}");
    } else {
        eprintln!("chain of errors:");
        for (level, error) in chain.iter().enumerate() {
            eprintln!("  {level}: {error}");
        }
    }

    eprintln!();
    eprintln!("Debug Info: {top_error:?}");
}
