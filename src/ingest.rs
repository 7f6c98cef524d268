//! File ingestion use case: parse the legacy extract, publish one message per user.

use crate::parser::FixedWidthOrderParser;
use crate::worker::{OrderPublisher, WorkerError};
use tracing::{info, instrument, warn};

/// Summary of one ingested file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub users: usize,
    pub published: usize,
    pub skipped_lines: usize,
}

#[derive(Clone)]
pub struct ProcessOrderFile {
    parser: FixedWidthOrderParser,
    publisher: OrderPublisher,
}

impl ProcessOrderFile {
    pub fn new(parser: FixedWidthOrderParser, publisher: OrderPublisher) -> Self {
        Self { parser, publisher }
    }

    /// Parses `content` and publishes every aggregate in first-seen order.
    ///
    /// Malformed lines never fail the call. A publish failure stops at the failing
    /// aggregate; the ones before it are already on the queue.
    #[instrument(skip(self, content), fields(bytes = content.len()))]
    pub async fn execute(&self, content: &str) -> Result<IngestReport, WorkerError> {
        let report = self.parser.parse_with_report(content);
        for issue in &report.issues {
            warn!(line = issue.line, "{}", issue);
        }

        let published = self.publisher.publish_users(&report.users).await?;
        let summary = IngestReport {
            users: report.users.len(),
            published,
            skipped_lines: report.skipped_lines(),
        };
        info!(
            users = summary.users,
            skipped = summary.skipped_lines,
            queue = %self.publisher.queue(),
            "File ingested"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RecordingTransport;
    use crate::transport::TransportError;
    use crate::worker::decode_user;
    use chrono::NaiveDate;
    use std::sync::Arc;

    const FILE: &str = "\
0000000070                              Palmer Prosacco00000007530000000003     1836.7420210308
0000000075                                  Bobbie Batz00000007980000000002     1578.5720211116
short line
0000000070                              Palmer Prosacco00000007530000000004      201.0020210308
";

    fn use_case(transport: &Arc<RecordingTransport>) -> ProcessOrderFile {
        ProcessOrderFile::new(
            FixedWidthOrderParser::with_processing_date(
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            ),
            OrderPublisher::new(transport.clone(), "user-orders"),
        )
    }

    #[tokio::test]
    async fn test_publishes_one_message_per_user() {
        let transport = Arc::new(RecordingTransport::new());
        let report = use_case(&transport).execute(FILE).await.unwrap();

        assert_eq!(
            report,
            IngestReport {
                users: 2,
                published: 2,
                skipped_lines: 1
            }
        );

        let published = transport.published();
        assert_eq!(published.len(), 2);
        assert!(published.iter().all(|m| m.queue == "user-orders"));
        assert!(published.iter().all(|m| m.options.persistent));

        let first = decode_user(&published[0].payload).unwrap();
        assert_eq!(first.id.0, 70);
        assert_eq!(first.orders.len(), 1);
        assert_eq!(first.orders[0].products.len(), 2);

        let message_id = published[0].options.message_id.clone().unwrap();
        assert!(message_id.starts_with("order-70-"), "{}", message_id);
    }

    #[tokio::test]
    async fn test_publish_failure_is_returned() {
        let transport = Arc::new(RecordingTransport::new());
        transport.fail_publishes(TransportError::NotConnected);

        let err = use_case(&transport).execute(FILE).await.unwrap_err();
        assert_eq!(err, WorkerError::Transport(TransportError::NotConnected));
    }
}
