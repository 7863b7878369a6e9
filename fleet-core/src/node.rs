//! Node identity.

/// Identity of this orchestrator process: `<hostname>-<pid>`.
///
/// Assignments in the KV store are owned by the node whose id matches; the
/// pid suffix keeps two processes on one host distinct.
pub fn node_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{host}-{}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_shape() {
        let id = node_id();
        let pid = std::process::id().to_string();
        assert!(id.ends_with(&pid));
        assert!(id.len() > pid.len());
    }
}
