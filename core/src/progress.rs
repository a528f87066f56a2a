/// Receives progress from long listings and bulk deletes.
pub trait ProgressSink: Send + Sync {
    fn start(&self, total: u64);

    fn advance(&self, delta: u64);

    fn finish(&self);
}

/// Discards all progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn start(&self, _total: u64) {}

    fn advance(&self, _delta: u64) {}

    fn finish(&self) {}
}
