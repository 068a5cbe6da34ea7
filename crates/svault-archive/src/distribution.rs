//! Destination selection for new batches.
//!
//! Batches go to the destination with the fewest assignments so far. Ties are
//! broken in configured order, starting just after the destination picked
//! last, which makes the policy plain round-robin when loads are level.

use std::collections::BTreeMap;

use svault_core::{SvaultError, SvaultResult};

/// Pick the destination for a new batch.
///
/// `explicit` must name one of `configured`. `loads` counts every batch ever
/// assigned to a destination; missing entries count as zero.
pub fn choose_destination(
    configured: &[String],
    explicit: Option<&str>,
    loads: &BTreeMap<String, u64>,
    last_assigned: Option<&str>,
) -> SvaultResult<String> {
    if let Some(dest) = explicit {
        return if configured.iter().any(|d| d == dest) {
            Ok(dest.to_string())
        } else {
            Err(SvaultError::UnknownDestination(dest.to_string()))
        };
    }

    if configured.is_empty() {
        return Err(SvaultError::Config("no destinations configured".into()));
    }

    let start = last_assigned
        .and_then(|last| configured.iter().position(|d| d == last))
        .map(|pos| pos + 1)
        .unwrap_or(0);

    let n = configured.len();
    let mut best: Option<(&String, u64)> = None;
    for offset in 0..n {
        let candidate = &configured[(start + offset) % n];
        let load = loads.get(candidate).copied().unwrap_or(0);
        match best {
            Some((_, best_load)) if best_load <= load => {}
            _ => best = Some((candidate, load)),
        }
    }

    best.map(|(dest, _)| dest.clone())
        .ok_or_else(|| SvaultError::Config("no destinations configured".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn dests(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("archive-{i}")).collect()
    }

    #[test]
    fn test_rotates_in_configured_order() {
        let configured = dests(3);
        let mut loads = BTreeMap::new();
        let mut last: Option<String> = None;
        let mut picked = Vec::new();

        for _ in 0..6 {
            let dest = choose_destination(&configured, None, &loads, last.as_deref()).unwrap();
            *loads.entry(dest.clone()).or_insert(0) += 1;
            last = Some(dest.clone());
            picked.push(dest);
        }

        assert_eq!(
            picked,
            vec!["archive-1", "archive-2", "archive-3", "archive-1", "archive-2", "archive-3"]
        );
    }

    #[test]
    fn test_least_loaded_wins() {
        let configured = dests(3);
        let loads = BTreeMap::from([
            ("archive-1".to_string(), 4),
            ("archive-2".to_string(), 1),
            ("archive-3".to_string(), 3),
        ]);
        let dest = choose_destination(&configured, None, &loads, Some("archive-1")).unwrap();
        assert_eq!(dest, "archive-2");
    }

    #[test]
    fn test_explicit_must_be_configured() {
        let configured = dests(2);
        let loads = BTreeMap::new();

        let dest = choose_destination(&configured, Some("archive-2"), &loads, None).unwrap();
        assert_eq!(dest, "archive-2");

        let err = choose_destination(&configured, Some("elsewhere"), &loads, None).unwrap_err();
        assert!(matches!(err, SvaultError::UnknownDestination(d) if d == "elsewhere"));
    }

    #[test]
    fn test_empty_configuration_is_an_error() {
        let err = choose_destination(&[], None, &BTreeMap::new(), None).unwrap_err();
        assert!(matches!(err, SvaultError::Config(_)));
    }

    proptest! {
        #[test]
        fn prop_counts_stay_balanced(n_dests in 1usize..6, n_batches in 0usize..60) {
            let configured = dests(n_dests);
            let mut loads = BTreeMap::new();
            let mut last: Option<String> = None;

            for _ in 0..n_batches {
                let dest = choose_destination(&configured, None, &loads, last.as_deref()).unwrap();
                *loads.entry(dest.clone()).or_insert(0u64) += 1;
                last = Some(dest);
            }

            let counts: Vec<u64> = configured
                .iter()
                .map(|d| loads.get(d).copied().unwrap_or(0))
                .collect();
            let max = counts.iter().max().copied().unwrap_or(0);
            let min = counts.iter().min().copied().unwrap_or(0);
            prop_assert!(max - min <= 1);
        }
    }
}
