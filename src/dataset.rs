//! Append-only CSV datasets shared by concurrent jobs
use crate::PipelineError;
use log::{debug, info, warn};
use std::{
    fs::{File, OpenOptions, TryLockError},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::mpsc::{Sender, channel},
    thread::JoinHandle,
    time::Duration,
};
use tempfile::TempPath;

/// Rows ready to be appended, header line included
#[derive(Debug)]
pub enum RowSet {
    /// a private, fully written temporary file, removed once dropped
    Temp(TempPath),
    /// a file owned by someone else, left in place
    File(PathBuf),
    /// rows assembled in memory
    Text(String),
}

impl RowSet {
    pub fn read(&self) -> std::io::Result<String> {
        match self {
            RowSet::Temp(path) => std::fs::read_to_string(path),
            RowSet::File(path) => std::fs::read_to_string(path),
            RowSet::Text(text) => Ok(text.clone()),
        }
    }

    /// Build an in-memory row set from a header and serializable records
    pub fn from_records<I, R>(header: &[&str], records: I) -> crate::Result<RowSet>
    where
        I: IntoIterator<Item = R>,
        R: IntoIterator,
        R::Item: AsRef<[u8]>,
    {
        let mut writer = csv::Writer::from_writer(vec![]);
        writer.write_record(header)?;
        for record in records {
            writer.write_record(record)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|err| std::io::Error::other(err.to_string()))?;
        Ok(RowSet::Text(String::from_utf8_lossy(&bytes).into_owned()))
    }
}

/// Retry policy for the dataset lock
#[derive(Debug, Clone, Copy)]
pub struct LockPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        LockPolicy {
            attempts: 600,
            delay: Duration::from_millis(100),
        }
    }
}

/// Exclusive lock on `<dataset>.lock`, released on drop
struct DatasetLock {
    file: File,
}

impl Drop for DatasetLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// One CSV file with a single header line and rows of equal width
#[derive(Debug, Clone)]
pub struct Dataset {
    path: PathBuf,
}

struct ParsedRows {
    header: csv::StringRecord,
    rows: Vec<csv::StringRecord>,
}

impl Dataset {
    pub fn new<P: AsRef<Path>>(path: P) -> Dataset {
        Dataset {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    fn mismatch(&self, reason: String) -> PipelineError {
        PipelineError::SchemaMismatch {
            dataset: self.path.clone(),
            reason,
        }
    }

    fn parse(&self, content: &str) -> crate::Result<ParsedRows> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(content.as_bytes());
        let header = reader.headers()?.clone();
        if header.is_empty() {
            return Err(self.mismatch("row set has no header".to_string()));
        }
        let mut rows = vec![];
        for (i, record) in reader.records().enumerate() {
            let record = record?;
            if record.len() != header.len() {
                return Err(self.mismatch(format!(
                    "row {} has {} columns, header has {}",
                    i + 1,
                    record.len(),
                    header.len()
                )));
            }
            rows.push(record);
        }
        Ok(ParsedRows { header, rows })
    }

    fn existing_header(&self) -> crate::Result<Option<csv::StringRecord>> {
        match std::fs::metadata(&self.path) {
            Ok(meta) if meta.len() > 0 => {
                let mut reader = csv::ReaderBuilder::new()
                    .has_headers(true)
                    .from_path(&self.path)?;
                Ok(Some(reader.headers()?.clone()))
            }
            Ok(_) => Ok(None),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Append `rowset` without taking the lock. The first writer copies the
    /// row set verbatim; later writers append its data lines only. Returns the
    /// number of data rows appended.
    pub fn append_rowset(&self, rowset: &RowSet) -> crate::Result<usize> {
        let content = rowset.read()?;
        let parsed = self.parse(&content)?;

        match self.existing_header()? {
            None => {
                if let Some(parent) = self.path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut file = File::create(&self.path)?;
                file.write_all(content.as_bytes())?;
                if !content.ends_with('\n') {
                    file.write_all(b"\n")?;
                }
                file.sync_all()?;
                debug!("Initialized {} with {} rows", self.path.display(), parsed.rows.len());
            }
            Some(header) => {
                if header != parsed.header {
                    return Err(self.mismatch(format!(
                        "header {:?} does not match {:?}",
                        parsed.header.iter().collect::<Vec<_>>(),
                        header.iter().collect::<Vec<_>>()
                    )));
                }
                let file = OpenOptions::new().append(true).open(&self.path)?;
                let mut writer = csv::WriterBuilder::new()
                    .has_headers(false)
                    .from_writer(BufWriter::new(file));
                for row in &parsed.rows {
                    writer.write_record(row)?;
                }
                writer.flush()?;
                let file = writer
                    .into_inner()
                    .map_err(|err| std::io::Error::other(err.to_string()))?
                    .into_inner()
                    .map_err(|err| err.into_error())?;
                file.sync_all()?;
            }
        }
        Ok(parsed.rows.len())
    }

    fn lock(&self, policy: &LockPolicy) -> crate::Result<DatasetLock> {
        let lock_path = self.lock_path();
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        for attempt in 0..policy.attempts {
            match file.try_lock() {
                Ok(()) => return Ok(DatasetLock { file }),
                Err(TryLockError::WouldBlock) => {
                    if attempt + 1 < policy.attempts {
                        std::thread::sleep(policy.delay);
                    }
                }
                Err(TryLockError::Error(err)) => return Err(err.into()),
            }
        }
        warn!(
            "Giving up on {} after {} attempts",
            lock_path.display(),
            policy.attempts
        );
        Err(PipelineError::AggregationConflict {
            dataset: self.path.clone(),
            attempts: policy.attempts,
        })
    }

    /// Append `rowset` while holding the dataset lock
    pub fn append_locked(&self, rowset: &RowSet, policy: &LockPolicy) -> crate::Result<usize> {
        let _lock = self.lock(policy)?;
        self.append_rowset(rowset)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateStats {
    pub rowsets: usize,
    pub rows: usize,
    pub failures: usize,
}

struct Submission {
    rowset: RowSet,
    reply: Sender<crate::Result<usize>>,
}

/// Single writer owning a dataset; jobs hand it row sets over a channel
pub struct Aggregator;

impl Aggregator {
    pub fn spawn(dataset: Dataset, policy: LockPolicy) -> crate::Result<AggregatorHandle> {
        let (sender, receiver) = channel::<Submission>();
        let path = dataset.path().to_path_buf();
        let thread = std::thread::Builder::new()
            .name(format!("aggregate-{}", crate::file_name_string(&path)))
            .spawn(move || {
                let mut stats = AggregateStats::default();
                for submission in receiver {
                    // still holds the file lock, other processes may append too
                    let result = dataset.append_locked(&submission.rowset, &policy);
                    match &result {
                        Ok(rows) => {
                            stats.rowsets += 1;
                            stats.rows += rows;
                        }
                        Err(err) => {
                            warn!("Append to {} failed: {}", dataset.path().display(), err);
                            stats.failures += 1;
                        }
                    }
                    let _ = submission.reply.send(result);
                }
                stats
            })?;
        Ok(AggregatorHandle {
            path,
            sender: Some(sender),
            thread: Some(thread),
        })
    }
}

pub struct AggregatorHandle {
    path: PathBuf,
    sender: Option<Sender<Submission>>,
    thread: Option<JoinHandle<AggregateStats>>,
}

impl AggregatorHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn stopped(&self) -> PipelineError {
        PipelineError::Io(std::io::Error::other(format!(
            "aggregator for {} stopped",
            self.path.display()
        )))
    }

    /// Hand `rowset` to the writer and wait until it is appended
    pub fn submit(&self, rowset: RowSet) -> crate::Result<usize> {
        let sender = self.sender.as_ref().ok_or_else(|| self.stopped())?;
        let (reply, response) = channel();
        sender
            .send(Submission { rowset, reply })
            .map_err(|_| self.stopped())?;
        response.recv().map_err(|_| self.stopped())?
    }

    /// Close the queue and wait for the writer to drain it
    pub fn finish(mut self) -> AggregateStats {
        self.sender.take();
        let stats = self
            .thread
            .take()
            .and_then(|thread| thread.join().ok())
            .unwrap_or_default();
        info!(
            "{}: appended {} rows from {} row sets",
            self.path.display(),
            stats.rows,
            stats.rowsets
        );
        stats
    }
}

impl Drop for AggregatorHandle {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn rows(prefix: &str, n: usize) -> RowSet {
        let mut text = "name,M,value\n".to_string();
        for i in 0..n {
            text.push_str(&format!("{}_{},10,{}\n", prefix, i, i));
        }
        RowSet::Text(text)
    }

    fn count_lines(path: &Path) -> (usize, usize) {
        let content = std::fs::read_to_string(path).unwrap();
        let headers = content.lines().filter(|l| l.starts_with("name,")).count();
        (headers, content.lines().count() - headers)
    }

    #[test]
    fn test_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = Dataset::new(dir.path().join("features.csv"));
        assert_eq!(dataset.append_rowset(&rows("a", 1)).unwrap(), 1);
        assert_eq!(dataset.append_rowset(&rows("b", 2)).unwrap(), 2);
        assert_eq!(
            std::fs::read_to_string(dataset.path()).unwrap(),
            "name,M,value\na_0,10,0\nb_0,10,0\nb_1,10,1\n"
        );
    }

    #[test]
    fn test_schema_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = Dataset::new(dir.path().join("features.csv"));
        dataset.append_rowset(&rows("a", 1)).unwrap();

        let wrong = RowSet::Text("name,M\nx,10\n".to_string());
        assert!(matches!(
            dataset.append_rowset(&wrong),
            Err(PipelineError::SchemaMismatch { .. })
        ));
        let ragged = RowSet::Text("name,M,value\nx,10\n".to_string());
        assert!(matches!(
            dataset.append_rowset(&ragged),
            Err(PipelineError::SchemaMismatch { .. })
        ));
        // nothing was appended
        assert_eq!(count_lines(dataset.path()), (1, 1));
    }

    #[test]
    fn test_temp_rowset_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let mut tmp = tempfile::NamedTempFile::new_in(dir.path()).unwrap();
        write!(tmp, "name,M,value\nt,10,1\n").unwrap();
        let path = tmp.into_temp_path();
        let on_disk = path.to_path_buf();
        let rowset = RowSet::Temp(path);

        let dataset = Dataset::new(dir.path().join("features.csv"));
        dataset.append_rowset(&rowset).unwrap();
        drop(rowset);
        assert!(!on_disk.exists());
    }

    #[test]
    fn test_lock_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = Dataset::new(dir.path().join("features.csv"));
        let held = dataset.lock(&LockPolicy::default()).unwrap();

        let policy = LockPolicy {
            attempts: 3,
            delay: Duration::from_millis(10),
        };
        match dataset.append_locked(&rows("a", 1), &policy) {
            Err(PipelineError::AggregationConflict { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!dataset.path().exists());

        drop(held);
        assert_eq!(dataset.append_locked(&rows("a", 1), &policy).unwrap(), 1);
    }

    #[test]
    fn test_concurrent_locked_writers() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = Arc::new(Dataset::new(dir.path().join("timing.csv")));
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let dataset = dataset.clone();
                std::thread::spawn(move || {
                    dataset
                        .append_locked(&rows(&format!("t{}", i), i + 1), &LockPolicy::default())
                        .unwrap()
                })
            })
            .collect();
        let total: usize = threads.into_iter().map(|t| t.join().unwrap()).sum();
        assert_eq!(total, (1..=8).sum::<usize>());
        assert_eq!(count_lines(dataset.path()), (1, total));
    }

    #[test]
    fn test_aggregator_actor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("features.csv");
        let handle = Aggregator::spawn(Dataset::new(&path), LockPolicy::default()).unwrap();
        std::thread::scope(|s| {
            for i in 0..6 {
                let handle = &handle;
                s.spawn(move || handle.submit(rows(&format!("job{}", i), 3)).unwrap());
            }
        });
        let bad = handle.submit(RowSet::Text("other\n1\n".to_string()));
        assert!(matches!(bad, Err(PipelineError::SchemaMismatch { .. })));

        let stats = handle.finish();
        assert_eq!(
            stats,
            AggregateStats {
                rowsets: 6,
                rows: 18,
                failures: 1
            }
        );
        assert_eq!(count_lines(&path), (1, 18));
    }

    #[test]
    fn test_from_records() {
        let rowset = RowSet::from_records(&["a", "b"], [["1", "x,y"]]).unwrap();
        assert_eq!(rowset.read().unwrap(), "a,b\n1,\"x,y\"\n");
    }
}
