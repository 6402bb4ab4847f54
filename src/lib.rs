/// keyfed - diagnosis key distribution and federation
///
/// This is the root crate that provides workspace-level documentation.
/// Actual implementation is in the subcrates:
/// - `keyfed-core`: key model, path stack, writable tree, signing and persistence
/// - `keyfed-distribution`: builds, signs and publishes the export hierarchy
/// - `keyfed-federation`: exchanges key batches with the federation gateway
/// - `keyfed-callback`: receives batch notifications from the gateway

/// Returns the version of the package.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_matches_manifest() {
        assert_eq!(version(), "0.1.0");
    }
}
