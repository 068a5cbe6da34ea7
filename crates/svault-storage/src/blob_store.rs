//! OpenDAL-backed transport
//!
//! Layout inside the operator root:
//! ```text
//! {dest}/.destination                               marker written by ensure_destination
//! {dest}/{batch_id}/{batch_id}.part000000.bin       chunk blobs
//! {dest}/{batch_id}/{batch_id}.manifest.json        manifest blob
//! {index_dest}/cards/{millis}-{uuid}.txt            batch cards
//! ```
//! Locators and card ids are the object paths.

use async_trait::async_trait;
use bytes::Bytes;
use opendal::{ErrorKind, Operator};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::transport::{BlobMeta, BlobTransport, Card, CardChannel, Locator, TransportError};

const DESTINATION_MARKER: &str = ".destination";

#[derive(Clone)]
pub struct OpendalTransport {
    op: Operator,
}

impl OpendalTransport {
    pub fn new(op: Operator) -> Self {
        Self { op }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    async fn destination_exists(&self, dest: &str) -> Result<bool, TransportError> {
        self.op
            .exists(&marker_path(dest))
            .await
            .map_err(|e| map_err(dest, e))
    }
}

fn marker_path(dest: &str) -> String {
    format!("{dest}/{DESTINATION_MARKER}")
}

fn validate_destination(dest: &str) -> Result<(), TransportError> {
    if dest.is_empty() || dest == "." || dest == ".." || dest.contains('/') || dest.contains('\\')
    {
        return Err(TransportError::InvalidDestination(dest.to_string()));
    }
    Ok(())
}

fn map_err(context: &str, e: opendal::Error) -> TransportError {
    if e.kind() == ErrorKind::NotFound {
        TransportError::NotFound(context.to_string())
    } else {
        TransportError::Failure(format!("{context}: {e}"))
    }
}

#[async_trait]
impl BlobTransport for OpendalTransport {
    async fn ensure_destination(&self, dest: &str) -> Result<(), TransportError> {
        validate_destination(dest)?;
        if self.destination_exists(dest).await? {
            return Ok(());
        }
        self.op
            .write(&marker_path(dest), Vec::<u8>::new())
            .await
            .map_err(|e| map_err(dest, e))?;
        debug!(dest, "created destination");
        Ok(())
    }

    async fn upload_blob(
        &self,
        dest: &str,
        data: Bytes,
        meta: &BlobMeta,
    ) -> Result<Locator, TransportError> {
        validate_destination(dest)?;
        if !self.destination_exists(dest).await? {
            return Err(TransportError::NotFound(format!("destination {dest}")));
        }

        let path = format!("{dest}/{}/{}", meta.batch_id, meta.file_name());
        let len = data.len();
        self.op
            .write(&path, data)
            .await
            .map_err(|e| map_err(&path, e))?;
        debug!(path = %path, bytes = len, "uploaded blob");
        Ok(Locator::new(path))
    }

    async fn download_blob(&self, locator: &Locator) -> Result<Bytes, TransportError> {
        let buf = self
            .op
            .read(locator.as_str())
            .await
            .map_err(|e| map_err(locator.as_str(), e))?;
        Ok(buf.to_bytes())
    }

    async fn list_blobs(&self, dest: &str) -> Result<Vec<Locator>, TransportError> {
        validate_destination(dest)?;
        let entries = self
            .op
            .list_with(&format!("{dest}/"))
            .recursive(true)
            .await
            .map_err(|e| map_err(dest, e))?;

        let mut out: Vec<Locator> = entries
            .into_iter()
            .filter(|e| e.metadata().is_file() && e.name() != DESTINATION_MARKER)
            .map(|e| Locator::new(e.path()))
            .collect();
        out.sort();
        Ok(out)
    }

    async fn delete_blob(&self, locator: &Locator) -> Result<(), TransportError> {
        let path = locator.as_str();
        let exists = self.op.exists(path).await.map_err(|e| map_err(path, e))?;
        if !exists {
            return Err(TransportError::NotFound(path.to_string()));
        }
        self.op.delete(path).await.map_err(|e| map_err(path, e))
    }
}

#[async_trait]
impl CardChannel for OpendalTransport {
    async fn post_card(&self, index_dest: &str, body: &str) -> Result<String, TransportError> {
        validate_destination(index_dest)?;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let id = format!(
            "{index_dest}/cards/{millis:013}-{}.txt",
            uuid::Uuid::new_v4().simple()
        );
        self.op
            .write(&id, body.as_bytes().to_vec())
            .await
            .map_err(|e| map_err(&id, e))?;
        Ok(id)
    }

    async fn update_card(&self, card_id: &str, body: &str) -> Result<(), TransportError> {
        let exists = self
            .op
            .exists(card_id)
            .await
            .map_err(|e| map_err(card_id, e))?;
        if !exists {
            return Err(TransportError::NotFound(card_id.to_string()));
        }
        self.op
            .write(card_id, body.as_bytes().to_vec())
            .await
            .map_err(|e| map_err(card_id, e))?;
        Ok(())
    }

    async fn list_cards(&self, index_dest: &str) -> Result<Vec<Card>, TransportError> {
        validate_destination(index_dest)?;
        let prefix = format!("{index_dest}/cards/");
        let entries = match self.op.list(&prefix).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(map_err(&prefix, e)),
        };

        let mut ids: Vec<String> = entries
            .into_iter()
            .filter(|e| e.metadata().is_file())
            .map(|e| e.path().to_string())
            .collect();
        ids.sort();

        let mut cards = Vec::with_capacity(ids.len());
        for id in ids {
            let buf = self.op.read(&id).await.map_err(|e| map_err(&id, e))?;
            cards.push(Card {
                body: String::from_utf8_lossy(&buf.to_vec()).into_owned(),
                id,
            });
        }
        Ok(cards)
    }
}
