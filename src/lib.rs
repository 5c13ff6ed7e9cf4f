// Copyright © 2025 The Nitro Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use std::error::Error;

pub mod cli;
mod test_util;

/// Renders a failed run for stderr: the top level error on the first line,
/// then every cause indented one step further than the one it explains.
pub fn error_report(error: &dyn Error) -> String {
    let mut report = format!("nitro: {error}");
    // Explicit deref, `source` is not found through `&&dyn Error`.
    let causes = std::iter::successors(error.source(), |cause| (*cause).source());
    for (depth, cause) in causes.enumerate() {
        report.push_str(&format!("\n{}caused by: {cause}", "  ".repeat(depth + 1)));
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_error_report_single() {
        let e = anyhow!("Failed to open the Nitro control device");
        assert_eq!(
            error_report(&*e),
            "nitro: Failed to open the Nitro control device"
        );
    }

    #[test]
    fn test_error_report_chain() {
        let e = anyhow!("Operation not permitted")
            .context("Failed to attach to VM created by pid 42")
            .context("Failed to attach to the VM of process 42");
        assert_eq!(
            error_report(&*e),
            "nitro: Failed to attach to the VM of process 42\n  \
             caused by: Failed to attach to VM created by pid 42\n    \
             caused by: Operation not permitted"
        );
    }
}
