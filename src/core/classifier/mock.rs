use super::{ClassPrediction, FaceClassifier, FaceDetection, NsfwClassifier};
use crate::core::error::PipelineError;
use crate::core::media::Frame;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

type Scripted<T> = Result<T, String>;

/// 按顺序吐出预设结果，脚本用完后一直返回最后一个
struct Script<T: Clone> {
    queue: Mutex<VecDeque<Scripted<T>>>,
    last: Mutex<Scripted<T>>,
}

impl<T: Clone> Script<T> {
    fn new(first: Scripted<T>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::from([first.clone()])),
            last: Mutex::new(first),
        }
    }

    fn push(&self, next: Scripted<T>) {
        self.queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(next);
    }

    fn next(&self) -> Scripted<T> {
        let popped = self
            .queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(next) = popped {
            *last = next;
        }
        last.clone()
    }
}

/// Mock NSFW 模型，用于测试
pub struct MockNsfwClassifier {
    script: Script<Vec<ClassPrediction>>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockNsfwClassifier {
    pub fn fixed(predictions: Vec<ClassPrediction>) -> Self {
        Self {
            script: Script::new(Ok(predictions)),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            script: Script::new(Err(reason.to_string())),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Each call sleeps for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queues answers for the following calls, in order.
    pub fn then(self, next: Vec<ClassPrediction>) -> Self {
        self.script.push(Ok(next));
        self
    }

    pub fn then_fail(self, reason: &str) -> Self {
        self.script.push(Err(reason.to_string()));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping calls seen so far.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NsfwClassifier for MockNsfwClassifier {
    async fn classify_nsfw(&self, _frame: &Frame) -> Result<Vec<ClassPrediction>, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.script.next().map_err(PipelineError::Classify)
    }
}

pub struct MockFaceClassifier {
    script: Script<Vec<FaceDetection>>,
    calls: AtomicUsize,
}

impl MockFaceClassifier {
    pub fn fixed(faces: Vec<FaceDetection>) -> Self {
        Self {
            script: Script::new(Ok(faces)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            script: Script::new(Err(reason.to_string())),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn then(self, next: Vec<FaceDetection>) -> Self {
        self.script.push(Ok(next));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FaceClassifier for MockFaceClassifier {
    async fn classify_faces(&self, _frame: &Frame) -> Result<Vec<FaceDetection>, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script.next().map_err(PipelineError::Classify)
    }
}
