//! Storage and destination health checks

use anyhow::Result;
use opendal::Operator;

use crate::transport::BlobTransport;

/// Verify the storage endpoint is reachable by listing the root
pub async fn check_health(op: &Operator) -> Result<()> {
    op.list("/")
        .await
        .map(|_| ())
        .map_err(|e| anyhow::anyhow!("storage health check failed: {e}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationHealth {
    pub destination: String,
    pub reachable: bool,
    pub blobs: usize,
    pub error: Option<String>,
}

/// List every destination once; a destination that cannot be listed is
/// reported, not fatal.
pub async fn check_destinations(
    transport: &dyn BlobTransport,
    destinations: &[String],
) -> Vec<DestinationHealth> {
    let mut out = Vec::with_capacity(destinations.len());
    for dest in destinations {
        let health = match transport.list_blobs(dest).await {
            Ok(blobs) => DestinationHealth {
                destination: dest.clone(),
                reachable: true,
                blobs: blobs.len(),
                error: None,
            },
            Err(e) => DestinationHealth {
                destination: dest.clone(),
                reachable: false,
                blobs: 0,
                error: Some(e.to_string()),
            },
        };
        out.push(health);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::BlobMeta;
    use crate::OpendalTransport;
    use bytes::Bytes;

    #[tokio::test]
    async fn reports_blob_counts_and_bad_names() {
        let op = Operator::new(opendal::services::Memory::default())
            .unwrap()
            .finish();
        check_health(&op).await.unwrap();

        let t = OpendalTransport::new(op);
        t.ensure_destination("vault").await.unwrap();
        t.upload_blob("vault", Bytes::from_static(b"x"), &BlobMeta::chunk("B", 0))
            .await
            .unwrap();

        let report =
            check_destinations(&t, &["vault".to_string(), "bad/name".to_string()]).await;
        assert_eq!(report[0].blobs, 1);
        assert!(report[0].reachable);
        assert!(!report[1].reachable);
        assert!(report[1].error.is_some());
    }
}
