//! Payload size aggregation.

use std::{future::Future, io, path::PathBuf};

use futures::{stream, StreamExt, TryStreamExt};

use crate::fixtures::FixtureSet;

/// Default number of `stat` calls kept in flight.
pub const DEFAULT_STAT_CONCURRENCY: usize = 5;

/// A fixture could not be stat'd.
#[derive(Debug, thiserror::Error)]
#[error("cannot stat {}: {source}", .path.display())]
pub struct StatError {
    /// The fixture that failed.
    pub path: PathBuf,
    /// Underlying failure.
    #[source]
    pub source: io::Error,
}

/// Sum the byte lengths of every fixture, with at most `concurrency` stat
/// calls outstanding.
///
/// The result is only produced once every stat has resolved. A `concurrency`
/// of zero is treated as one.
///
/// # Errors
///
/// The first failing stat aborts the aggregation; the partial sum is
/// discarded.
pub async fn total_size(fixtures: &FixtureSet, concurrency: usize) -> Result<u64, StatError> {
    let total = sum_lengths(fixtures, concurrency, |path| async move {
        tokio::fs::metadata(&path).await.map(|meta| meta.len())
    })
    .await?;

    tracing::debug!(files = fixtures.len(), total, "aggregated fixture sizes");

    Ok(total)
}

async fn sum_lengths<F, Fut>(
    fixtures: &FixtureSet,
    concurrency: usize,
    stat: F,
) -> Result<u64, StatError>
where
    F: Fn(PathBuf) -> Fut,
    Fut: Future<Output = io::Result<u64>>,
{
    stream::iter(fixtures.iter())
        .map(|fixture| {
            let path = fixture.as_path().to_path_buf();
            let len = stat(path.clone());
            async move { len.await.map_err(|source| StatError { path, source }) }
        })
        .buffer_unordered(concurrency.max(1))
        .try_fold(0u64, |acc, len| async move { Ok(acc + len) })
        .await
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use rstest::rstest;

    use super::{sum_lengths, total_size, StatError};
    use crate::fixtures::{enumerate, FixturePath, FixtureSet};

    #[rstest]
    #[case(1)]
    #[case(5)]
    #[case(64)]
    #[tokio::test]
    async fn sum_is_independent_of_concurrency(#[case] concurrency: usize) {
        let dir = tempfile::tempdir().unwrap();
        let mut expected = 0;
        for i in 0..20usize {
            let len = i * 37 + 1;
            fs::write(dir.path().join(format!("f{i:02}")), vec![b'x'; len]).unwrap();
            expected += len as u64;
        }

        let set = enumerate(dir.path()).unwrap();
        assert_eq!(total_size(&set, concurrency).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn zero_concurrency_still_makes_progress() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("one"), b"abc").unwrap();

        let set = enumerate(dir.path()).unwrap();
        assert_eq!(total_size(&set, 0).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn empty_set_sums_to_zero() {
        assert_eq!(total_size(&FixtureSet::default(), 5).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_file_fails_whole_aggregation() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("present"), b"abc").unwrap();
        let missing = dir.path().join("gone");

        let set: FixtureSet = [
            FixturePath::new(dir.path().join("present")),
            FixturePath::new(&missing),
        ]
        .into_iter()
        .collect();

        let err: StatError = total_size(&set, 5).await.unwrap_err();
        assert_eq!(err.path, missing);
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(5)]
    #[tokio::test]
    async fn never_exceeds_stat_concurrency(#[case] concurrency: usize) {
        let set: FixtureSet = (0..17)
            .map(|i| FixturePath::new(format!("fixture{i}")))
            .collect();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let total = sum_lengths(&set, concurrency, |_| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(2)
            }
        })
        .await
        .unwrap();

        assert_eq!(total, 34);
        assert_eq!(peak.load(Ordering::SeqCst), concurrency);
    }
}
