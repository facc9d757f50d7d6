//! JSONL replay source.
//!
//! Reads captured Jetstream envelopes (one JSON object per line) and feeds
//! them through the same handler as the live source. Used for backfills,
//! reprocessing and integration tests.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use metrics::counter;
use rito_core::JetstreamEvent;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

use super::{EventHandler, EventSource, SourceStats};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct JsonlConfig {
    /// Input file or directory path.
    pub input: PathBuf,

    /// Continue past lines that do not decode (log and skip them).
    pub continue_on_error: bool,

    /// Skip envelopes at or before the handler's resume cursor.
    pub skip_processed: bool,

    /// Limit number of files to process.
    pub limit: Option<usize>,
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            continue_on_error: true,
            skip_processed: false,
            limit: None,
        }
    }
}

pub struct JsonlSource {
    config: JsonlConfig,
}

/// Why a file stopped early.
enum FileEnd {
    Finished,
    Stopped,
}

impl JsonlSource {
    pub fn new(config: JsonlConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &JsonlConfig {
        &self.config
    }

    /// Collect files to process based on input path.
    fn collect_files(&self) -> Result<Vec<PathBuf>> {
        let input = &self.config.input;

        let mut files = if input.is_file() {
            vec![input.clone()]
        } else if input.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(input)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|path| {
                    path.is_file()
                        && path
                            .extension()
                            .is_some_and(|ext| ext == "jsonl" || ext == "json" || ext == "ndjson")
                })
                .collect();
            // Sorted so that time-ordered capture files replay in order.
            entries.sort();
            entries
        } else {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Input path does not exist: {}", input.display()),
            )));
        };

        if let Some(limit) = self.config.limit {
            files.truncate(limit);
        }

        Ok(files)
    }

    async fn process_file<H: EventHandler>(
        &self,
        path: &Path,
        handler: &mut H,
        shutdown: &watch::Receiver<bool>,
        stats: &mut SourceStats,
    ) -> Result<FileEnd> {
        let file = File::open(path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut line_num = 0usize;

        while let Some(line) = lines.next_line().await? {
            line_num += 1;
            *stats.source_metadata.bytes_read.get_or_insert(0) += line.len() + 1;

            if *shutdown.borrow() {
                return Ok(FileEnd::Stopped);
            }
            if line.trim().is_empty() {
                continue;
            }

            let event = match JetstreamEvent::from_json(&line) {
                Ok(event) => event,
                Err(e) => {
                    stats.decode_errors += 1;
                    counter!("jetstream_decode_errors_total").increment(1);
                    tracing::warn!("{}:{}: {}", path.display(), line_num, e);
                    if self.config.continue_on_error {
                        continue;
                    }
                    return Err(Error::Json(format!(
                        "{}:{}: {}",
                        path.display(),
                        line_num,
                        e
                    )));
                }
            };

            if self.config.skip_processed
                && handler
                    .resume_cursor()
                    .is_some_and(|cursor| event.time_us <= cursor)
            {
                continue;
            }

            stats.total_events += 1;
            counter!("jetstream_events_received_total").increment(1);

            match handler.handle(event).await {
                Ok(true) => {}
                Ok(false) => return Ok(FileEnd::Stopped),
                Err(e) => {
                    stats.handler_errors += 1;
                    tracing::error!("{}:{}: {}", path.display(), line_num, e);
                    return Err(e);
                }
            }
        }

        Ok(FileEnd::Finished)
    }
}

#[async_trait]
impl EventSource for JsonlSource {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    async fn run<H: EventHandler>(
        &mut self,
        handler: &mut H,
        shutdown: watch::Receiver<bool>,
    ) -> Result<SourceStats> {
        let files = self.collect_files()?;
        tracing::info!("Replaying {} JSONL file(s)", files.len());

        let mut stats = SourceStats::default();
        let mut files_processed = 0usize;

        for path in &files {
            tracing::info!("Processing {}", path.display());
            let end = self.process_file(path, handler, &shutdown, &mut stats).await?;
            files_processed += 1;
            if matches!(end, FileEnd::Stopped) {
                tracing::info!("Replay stopped in {}", path.display());
                break;
            }
        }

        stats.source_metadata.files_processed = Some(files_processed);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    /// Collects events and stops after `stop_after` if set.
    #[derive(Default)]
    struct Collect {
        seen: Vec<i64>,
        stop_after: Option<usize>,
        cursor: Option<i64>,
    }

    #[async_trait]
    impl EventHandler for Collect {
        async fn handle(&mut self, event: JetstreamEvent) -> Result<bool> {
            self.seen.push(event.time_us);
            Ok(self.stop_after.is_none_or(|n| self.seen.len() < n))
        }

        fn resume_cursor(&self) -> Option<i64> {
            self.cursor
        }
    }

    fn line(time_us: i64) -> String {
        format!(r#"{{"did":"did:plc:abc","time_us":{time_us},"kind":"account","account":{{"active":true,"did":"did:plc:abc","seq":1,"time":"t"}}}}"#)
    }

    fn write_file(dir: &TempDir, name: &str, lines: &[String]) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        for l in lines {
            writeln!(f, "{l}").unwrap();
        }
        path
    }

    fn no_shutdown() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn test_replays_directory_in_name_order() {
        let dir = TempDir::new().unwrap();
        write_file(&dir, "b.jsonl", &[line(3), line(4)]);
        write_file(&dir, "a.jsonl", &[line(1), String::new(), line(2)]);
        write_file(&dir, "ignored.txt", &[line(99)]);

        let mut source = JsonlSource::new(JsonlConfig {
            input: dir.path().to_path_buf(),
            ..Default::default()
        });
        let mut handler = Collect::default();
        let stats = source.run(&mut handler, no_shutdown()).await.unwrap();

        assert_eq!(handler.seen, vec![1, 2, 3, 4]);
        assert_eq!(stats.total_events, 4);
        assert_eq!(stats.source_metadata.files_processed, Some(2));
    }

    #[tokio::test]
    async fn test_bad_lines() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "x.jsonl", &[line(1), "{oops".to_string(), line(2)]);

        let mut source = JsonlSource::new(JsonlConfig {
            input: path.clone(),
            ..Default::default()
        });
        let mut handler = Collect::default();
        let stats = source.run(&mut handler, no_shutdown()).await.unwrap();
        assert_eq!(handler.seen, vec![1, 2]);
        assert_eq!(stats.decode_errors, 1);

        let mut strict = JsonlSource::new(JsonlConfig {
            input: path,
            continue_on_error: false,
            ..Default::default()
        });
        assert!(strict.run(&mut Collect::default(), no_shutdown()).await.is_err());
    }

    #[tokio::test]
    async fn test_handler_can_stop() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "x.jsonl", &[line(1), line(2), line(3)]);

        let mut source = JsonlSource::new(JsonlConfig {
            input: path,
            ..Default::default()
        });
        let mut handler = Collect {
            stop_after: Some(2),
            ..Default::default()
        };
        source.run(&mut handler, no_shutdown()).await.unwrap();
        assert_eq!(handler.seen, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_skip_processed() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "x.jsonl", &[line(1), line(2), line(3)]);

        let mut source = JsonlSource::new(JsonlConfig {
            input: path,
            skip_processed: true,
            ..Default::default()
        });
        let mut handler = Collect {
            cursor: Some(2),
            ..Default::default()
        };
        source.run(&mut handler, no_shutdown()).await.unwrap();
        assert_eq!(handler.seen, vec![3]);
    }

    #[tokio::test]
    async fn test_missing_input() {
        let mut source = JsonlSource::new(JsonlConfig {
            input: PathBuf::from("/definitely/not/here.jsonl"),
            ..Default::default()
        });
        assert!(source.run(&mut Collect::default(), no_shutdown()).await.is_err());
    }
}
