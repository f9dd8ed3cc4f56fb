use bollard::models::CreateImageInfo;
use futures::stream::Stream;
use futures::StreamExt;
use tracing::debug;

use super::client::{RuntimeError, RuntimeResult};

/// Result of draining a pull-progress stream to completion.
#[derive(Debug)]
pub struct PullOutcome {
    pub records: Vec<CreateImageInfo>,
}

/// Drains a pull-progress stream, invoking `on_progress` for every record.
///
/// The stream carries newline-delimited progress records as emitted by the
/// runtime. Lines that fail to decode as a progress record are skipped
/// without aborting the pull (the runtime interleaves occasional
/// whitespace); the drain fails iff the transport itself errors or a
/// record carries an `error` field, which the runtime only sets on its
/// final record for a failed pull.
pub async fn follow_progress<S, F>(
    image: &str,
    mut stream: S,
    mut on_progress: Option<F>,
) -> RuntimeResult<PullOutcome>
where
    S: Stream<Item = Result<CreateImageInfo, bollard::errors::Error>> + Unpin,
    F: FnMut(&CreateImageInfo),
{
    let mut records = Vec::new();

    while let Some(item) = stream.next().await {
        let record = match item {
            Ok(record) => record,
            Err(e) if is_decode_error(&e) => {
                debug!("Skipping malformed progress line for {}: {}", image, e);
                continue;
            }
            Err(e) => {
                return Err(RuntimeError::PullFailed {
                    image: image.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        if let Some(status) = &record.status {
            debug!("Pull {}: {}", image, status);
        }

        if let Some(hook) = on_progress.as_mut() {
            hook(&record);
        }

        let failed = record.error.clone();
        records.push(record);

        if let Some(reason) = failed {
            return Err(RuntimeError::PullFailed {
                image: image.to_string(),
                reason,
            });
        }
    }

    Ok(PullOutcome { records })
}

/// A stream item that failed JSON decoding is one malformed progress line,
/// not a dead connection.
fn is_decode_error(err: &bollard::errors::Error) -> bool {
    use bollard::errors::Error as E;
    matches!(err, E::JsonDataError { .. } | E::JsonSerdeError { .. })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn record(status: &str) -> CreateImageInfo {
        CreateImageInfo {
            status: Some(status.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn collects_records_and_invokes_hook() {
        let items: Vec<Result<CreateImageInfo, bollard::errors::Error>> =
            vec![Ok(record("Pulling fs layer")), Ok(record("Download complete"))];
        let mut seen = 0usize;

        let outcome = follow_progress(
            "alpine:latest",
            stream::iter(items),
            Some(|_r: &CreateImageInfo| seen += 1),
        )
        .await
        .unwrap();

        assert_eq!(outcome.records.len(), 2);
        assert_eq!(seen, 2);
    }

    #[tokio::test]
    async fn surfaces_error_record() {
        let failed = CreateImageInfo {
            error: Some("manifest unknown".to_string()),
            ..Default::default()
        };
        let items: Vec<Result<CreateImageInfo, bollard::errors::Error>> =
            vec![Ok(record("Pulling fs layer")), Ok(failed)];

        let err = follow_progress("no/such:image", stream::iter(items), None::<fn(&CreateImageInfo)>)
            .await
            .unwrap_err();

        match err {
            RuntimeError::PullFailed { image, reason } => {
                assert_eq!(image, "no/such:image");
                assert_eq!(reason, "manifest unknown");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn malformed_progress_line_does_not_abort_the_pull() {
        let bad_line = bollard::errors::Error::JsonSerdeError {
            err: serde_json::from_str::<serde_json::Value>("{not json").unwrap_err(),
        };
        let items: Vec<Result<CreateImageInfo, bollard::errors::Error>> = vec![
            Ok(record("Pulling fs layer")),
            Err(bad_line),
            Ok(record("Download complete")),
        ];

        let outcome = follow_progress(
            "alpine:latest",
            stream::iter(items),
            None::<fn(&CreateImageInfo)>,
        )
        .await
        .unwrap();

        assert_eq!(outcome.records.len(), 2);
    }

    #[tokio::test]
    async fn transport_failure_is_fatal() {
        let dropped = bollard::errors::Error::IOError {
            err: std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"),
        };
        let items: Vec<Result<CreateImageInfo, bollard::errors::Error>> =
            vec![Ok(record("Pulling fs layer")), Err(dropped)];

        let err = follow_progress(
            "alpine:latest",
            stream::iter(items),
            None::<fn(&CreateImageInfo)>,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RuntimeError::PullFailed { .. }));
    }

    #[tokio::test]
    async fn empty_stream_is_a_successful_pull() {
        let items: Vec<Result<CreateImageInfo, bollard::errors::Error>> = vec![];
        let outcome = follow_progress("alpine:latest", stream::iter(items), None::<fn(&CreateImageInfo)>)
            .await
            .unwrap();
        assert!(outcome.records.is_empty());
    }
}
