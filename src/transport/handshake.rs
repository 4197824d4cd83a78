//! Connection preamble: every new TCP connection sends a `HandshakePreamble`
//! before any other frame. A cluster name mismatch closes the connection —
//! this is the one piece of wire validation that happens before framing is
//! even fully trusted.

use crate::error::{RaftError, Result};
use crate::transport::HandshakePreamble;
use crate::types::ClusterName;

pub fn validate(preamble: &HandshakePreamble, expected_cluster: &ClusterName) -> Result<()> {
    if &preamble.cluster_name != expected_cluster {
        return Err(RaftError::MalformedMessage {
            peer: preamble.node_id,
            reason: format!(
                "cluster name mismatch: expected '{}', got '{}'",
                expected_cluster, preamble.cluster_name
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_matching_cluster_name() {
        let cluster = ClusterName::new("prod").unwrap();
        let preamble = HandshakePreamble {
            cluster_name: cluster.clone(),
            node_id: 1,
            term_hint: 0,
        };
        assert!(validate(&preamble, &cluster).is_ok());
    }

    #[test]
    fn rejects_mismatched_cluster_name() {
        let cluster = ClusterName::new("prod").unwrap();
        let other = ClusterName::new("staging").unwrap();
        let preamble = HandshakePreamble {
            cluster_name: other,
            node_id: 1,
            term_hint: 0,
        };
        assert!(validate(&preamble, &cluster).is_err());
    }
}
