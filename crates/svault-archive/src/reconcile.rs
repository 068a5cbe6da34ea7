//! Rebuilding the metadata index from the card history.
//!
//! Only cards and manifest blobs are read; chunk blobs are never touched.
//! Cards that cannot be parsed and manifests that cannot be decoded are
//! counted and skipped. Every manifest is fetched before the index is
//! touched, so an unreachable remote leaves the local rows as they were.

use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use svault_core::{BatchStatus, SvaultResult, SyncMode, SyncReport};
use svault_storage::{Locator, TransportError};

use crate::card::{parse_card, CardMeta};
use crate::engine::{transport_error, Engine};
use crate::index::ReconciledBatch;
use crate::manifest::decode;
use crate::retry::with_retry;

impl Engine {
    /// Reconcile the local index with the remote card history.
    ///
    /// `Augment` adds batches missing locally; `Reset` replaces every local
    /// row with what the card history describes.
    pub async fn sync(&self, mode: SyncMode) -> SvaultResult<SyncReport> {
        let index_dest = self.settings.index_destination.clone();
        let listed = with_retry(&self.settings.retry, "list cards", || {
            let cards = self.cards.clone();
            let dest = index_dest.clone();
            async move { cards.list_cards(&dest).await }
        })
        .await;
        let cards = match listed.result {
            Ok(cards) => cards,
            Err(TransportError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(transport_error(format!("listing cards in {index_dest}"), e)),
        };

        let reset = mode == SyncMode::Reset;
        let mut report = SyncReport::default();

        // Cards are edited in place, but a batch may own more than one card
        // (a vanished card is re-posted). The newest one wins.
        let mut latest: BTreeMap<String, (String, CardMeta)> = BTreeMap::new();
        for card in cards {
            match parse_card(&card.body) {
                Ok(meta) => {
                    latest.insert(meta.batch_id.clone(), (card.id, meta));
                }
                Err(e) => {
                    debug!(card_id = %card.id, "skipping card: {e}");
                    report.skipped += 1;
                }
            }
        }

        let mut staged = Vec::new();
        for (batch_id, (card_id, meta)) in latest {
            if meta.status == BatchStatus::Deleted {
                report.tombstoned += 1;
                continue;
            }
            if !reset && self.index.contains(&batch_id) {
                report.already_present += 1;
                continue;
            }
            let Some(manifest_locator) = meta.manifest else {
                report.incomplete += 1;
                continue;
            };

            let locator = Locator::new(manifest_locator.clone());
            let fetched = with_retry(&self.settings.retry, "download manifest", || {
                let blobs = self.blobs.clone();
                let locator = locator.clone();
                async move { blobs.download_blob(&locator).await }
            })
            .await;
            let bytes = match fetched.result {
                Ok(bytes) => bytes,
                Err(TransportError::NotFound(_)) => {
                    warn!(batch_id = %batch_id, manifest = %manifest_locator, "manifest missing, skipping");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    return Err(transport_error(
                        format!("downloading manifest {manifest_locator}"),
                        e,
                    ))
                }
            };

            let manifest = match decode(&bytes) {
                Ok(m) if m.batch_id == batch_id => m,
                Ok(m) => {
                    warn!(batch_id = %batch_id, found = %m.batch_id, "manifest belongs to another batch, skipping");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(batch_id = %batch_id, "undecodable manifest, skipping: {e}");
                    report.skipped += 1;
                    continue;
                }
            };

            let (batch, chunks) = manifest.to_rows(&manifest_locator, Some(card_id));
            debug!(batch_id = %batch_id, legacy = manifest.is_legacy(), "manifest staged");
            staged.push(ReconciledBatch {
                batch,
                chunks,
                files: manifest.files,
            });
        }

        if reset {
            report.inserted = self.index.replace_all(staged)?;
        } else {
            for rows in staged {
                if self.index.insert_reconciled(rows)? {
                    report.inserted += 1;
                } else {
                    report.already_present += 1;
                }
            }
        }

        info!(
            mode = ?mode,
            inserted = report.inserted,
            present = report.already_present,
            skipped = report.skipped,
            incomplete = report.incomplete,
            tombstoned = report.tombstoned,
            "index reconciled"
        );
        Ok(report)
    }
}
