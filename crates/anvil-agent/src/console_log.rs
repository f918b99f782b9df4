//! Console history of an instance: the in-memory tail served to clients and
//! the rotated `logs/console.log` on disk.

use std::{
    collections::VecDeque,
    io,
    path::{Path, PathBuf},
};

use tokio::{
    io::AsyncWriteExt,
    sync::{mpsc, oneshot},
};

/// Last `capacity` console lines. Line `n` (1-based, never reused) is the
/// n-th line ever pushed; cursors returned to clients are line numbers.
#[derive(Debug)]
pub struct ConsoleTail {
    capacity: usize,
    /// Number of the line at the front of `lines`.
    front: u64,
    lines: VecDeque<String>,
}

impl ConsoleTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            front: 1,
            lines: VecDeque::with_capacity(capacity.clamp(1, 1024)),
        }
    }

    pub fn push(&mut self, line: String) -> u64 {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
            self.front += 1;
        }
        self.lines.push_back(line);
        self.last_seq()
    }

    /// Number of the newest line, 0 before the first push.
    pub fn last_seq(&self) -> u64 {
        self.front + self.lines.len() as u64 - 1
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    /// Up to `limit` lines after `cursor` and the cursor to poll with next.
    /// Cursor 0 asks for the newest `limit` lines. Lines already evicted are skipped.
    pub fn read_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        let len = self.lines.len();
        let start = if cursor == 0 {
            len.saturating_sub(limit)
        } else {
            usize::try_from(cursor.saturating_sub(self.front - 1))
                .map_or(len, |skip| skip.min(len))
        };
        let end = start.saturating_add(limit).min(len);
        if start == end {
            return (Vec::new(), cursor);
        }
        let lines = self.lines.range(start..end).cloned().collect();
        (lines, self.front + end as u64 - 1)
    }
}

enum LogCommand {
    Line(String),
    Close(oneshot::Sender<()>),
}

/// Sender side of an instance's `console.log` writer task.
#[derive(Debug, Clone)]
pub struct ConsoleLog {
    tx: mpsc::UnboundedSender<LogCommand>,
}

impl ConsoleLog {
    /// Spawns the writer task. Must be called within a tokio runtime.
    pub fn spawn(path: PathBuf, max_bytes: u64, keep: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(path, max_bytes, keep, rx));
        Self { tx }
    }

    /// Queue a line. Lines queued after [`ConsoleLog::close`] are dropped.
    pub fn append(&self, line: &str) {
        if self.tx.send(LogCommand::Line(line.to_string())).is_err() {
            tracing::trace!("console log closed, line dropped");
        }
    }

    /// Flush queued lines and close the file. Returns once the writer is done.
    pub async fn close(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(LogCommand::Close(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn run_writer(
    path: PathBuf,
    max_bytes: u64,
    keep: usize,
    mut rx: mpsc::UnboundedReceiver<LogCommand>,
) {
    let mut file = match RotatingFile::open(path.clone(), max_bytes, keep).await {
        Ok(f) => Some(f),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "console log disabled");
            None
        }
    };
    let mut failing = false;
    while let Some(cmd) = rx.recv().await {
        match cmd {
            LogCommand::Line(line) => {
                let Some(f) = file.as_mut() else { continue };
                match f.write_line(&line).await {
                    Ok(()) => failing = false,
                    Err(e) if !failing => {
                        failing = true;
                        tracing::warn!(path = %path.display(), error = %e, "console log write failed");
                    }
                    Err(_) => {}
                }
            }
            LogCommand::Close(done) => {
                if let Some(mut f) = file.take()
                    && let Err(e) = f.file.flush().await
                {
                    tracing::warn!(path = %path.display(), error = %e, "console log flush failed");
                }
                let _ = done.send(());
                break;
            }
        }
    }
    if let Some(mut f) = file
        && let Err(e) = f.file.flush().await
    {
        tracing::warn!(path = %path.display(), error = %e, "console log flush failed");
    }
}

/// `console.log` plus up to `keep` older generations `console.log.1` (newest) .. `console.log.<keep>`.
struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    keep: usize,
    len: u64,
    file: tokio::fs::File,
}

async fn open_append(path: &Path) -> io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

async fn rename_if_present(from: &Path, to: &Path) -> io::Result<()> {
    match tokio::fs::rename(from, to).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl RotatingFile {
    async fn open(path: PathBuf, max_bytes: u64, keep: usize) -> io::Result<Self> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let file = open_append(&path).await?;
        let len = file.metadata().await?.len();
        Ok(Self {
            path,
            max_bytes,
            keep,
            len,
            file,
        })
    }

    fn generation(&self, n: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    async fn rotate(&mut self) -> io::Result<()> {
        self.file.flush().await?;
        if self.keep == 0 {
            self.file.set_len(0).await?;
            self.len = 0;
            return Ok(());
        }
        for n in (1..self.keep).rev() {
            rename_if_present(&self.generation(n), &self.generation(n + 1)).await?;
        }
        rename_if_present(&self.path, &self.generation(1)).await?;
        self.file = open_append(&self.path).await?;
        self.len = 0;
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> io::Result<()> {
        let needed = line.len() as u64 + 1;
        if self.max_bytes > 0 && self.len > 0 && self.len + needed > self.max_bytes {
            self.rotate().await?;
        }
        self.file.write_all(line.as_bytes()).await?;
        self.file.write_all(b"\n").await?;
        self.len += needed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_evicts_oldest_and_keeps_numbering() {
        let mut t = ConsoleTail::new(3);
        assert_eq!(t.last_seq(), 0);
        for i in 0..5 {
            t.push(format!("l{i}"));
        }
        assert_eq!(t.snapshot(), vec!["l2", "l3", "l4"]);
        assert_eq!(t.last_seq(), 5);
    }

    #[test]
    fn read_after_cursor() {
        let mut t = ConsoleTail::new(10);
        assert_eq!(t.read_after(0, 5), (Vec::<String>::new(), 0));
        for i in 0..5 {
            t.push(format!("l{i}"));
        }
        assert_eq!(t.read_after(0, 2), (vec!["l3".into(), "l4".into()], 5));
        assert_eq!(
            t.read_after(2, 10),
            (vec!["l2".into(), "l3".into(), "l4".into()], 5)
        );
        assert_eq!(t.read_after(1, 2), (vec!["l1".into(), "l2".into()], 3));
        assert_eq!(t.read_after(5, 10), (Vec::<String>::new(), 5));
    }

    #[test]
    fn read_after_an_evicted_cursor_starts_at_the_oldest_kept_line() {
        let mut t = ConsoleTail::new(2);
        for i in 0..6 {
            t.push(format!("l{i}"));
        }
        assert_eq!(t.read_after(1, 10), (vec!["l4".into(), "l5".into()], 6));
    }

    #[tokio::test]
    async fn file_rotates_when_full() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("console.log");
        let mut f = RotatingFile::open(path.clone(), 16, 2).await.unwrap();
        for line in ["0123456789", "abcdefghij", "ABCDEFGHIJ"] {
            f.write_line(line).await.unwrap();
        }
        f.file.flush().await.unwrap();

        let read = |p: PathBuf| std::fs::read_to_string(p).unwrap();
        assert_eq!(read(path.clone()), "ABCDEFGHIJ\n");
        assert_eq!(read(f.generation(1)), "abcdefghij\n");
        assert_eq!(read(f.generation(2)), "0123456789\n");
    }

    #[tokio::test]
    async fn close_flushes_and_drops_later_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.log");
        let log = ConsoleLog::spawn(path.clone(), 1024, 1);
        log.append("before");
        log.close().await;
        log.append("after");
        log.close().await;
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "before\n");
    }
}
