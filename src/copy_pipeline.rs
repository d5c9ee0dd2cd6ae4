//! Single worker pipeline decoupling disk I/O from stream I/O
//!
//! When multi threading is enabled, one side of the codec performs the
//! library I/O and hands `(offset, data)` jobs to a worker owning the other
//! side. Jobs travel through a bounded channel, so a fast producer blocks
//! instead of buffering unbounded amounts of sector data. [`flush`] is a
//! barrier: it returns once every job submitted before it has been
//! processed, which keeps the framing on the stream sequential between CBT
//! segments.
//!
//! [`flush`]: CopyPipeline::flush

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{bail, format_err, Error};
use crossbeam_channel::{bounded, Sender};

enum Message<J> {
    Job(J),
    Flush(Sender<()>),
}

/// A handle to the worker thread. Dropping it without calling
/// [`complete`](Self::complete) shuts the worker down but swallows its
/// error state.
pub struct CopyPipeline<J: Send + 'static> {
    handle: JoinHandle<()>,
    input: Sender<Message<J>>,
    abort: Arc<Mutex<Option<String>>>,
    name: String,
}

impl<J: Send + 'static> CopyPipeline<J> {
    /// Spawn the worker. Each job is passed to `handler`; the first error
    /// marks the pipeline as failed, further jobs are drained without being
    /// processed.
    pub fn new<F>(name: &str, queue_depth: usize, mut handler: F) -> Result<Self, Error>
    where
        F: FnMut(J) -> Result<(), Error> + Send + 'static,
    {
        let (input, output) = bounded::<Message<J>>(queue_depth);
        let abort = Arc::new(Mutex::new(None));

        let worker_abort = Arc::clone(&abort);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                match output.recv() {
                    Ok(Message::Job(job)) => {
                        if worker_abort.lock().unwrap().is_some() {
                            continue;
                        }
                        if let Err(err) = handler(job) {
                            let mut guard = worker_abort.lock().unwrap();
                            if guard.is_none() {
                                *guard = Some(err.to_string());
                            }
                        }
                    }
                    Ok(Message::Flush(ack)) => {
                        let _ = ack.send(());
                    }
                    Err(_) => return,
                }
            })?;

        Ok(Self {
            handle,
            input,
            abort,
            name: name.to_string(),
        })
    }

    fn check_abort(&self) -> Result<(), Error> {
        if let Some(message) = &*self.abort.lock().unwrap() {
            bail!("{}: {}", self.name, message);
        }
        Ok(())
    }

    /// Queue a job, blocking while the queue is full.
    pub fn send(&self, job: J) -> Result<(), Error> {
        self.check_abort()?;
        self.input
            .send(Message::Job(job))
            .map_err(|_| format_err!("{}: worker is gone", self.name))?;
        Ok(())
    }

    /// Block until every previously queued job has been processed.
    pub fn flush(&self) -> Result<(), Error> {
        self.check_abort()?;

        let (ack, done) = bounded(0);
        self.input
            .send(Message::Flush(ack))
            .map_err(|_| format_err!("{}: worker is gone", self.name))?;
        done.recv()
            .map_err(|_| format_err!("{}: worker is gone", self.name))?;

        // Fail at the segment boundary instead of on the next send.
        self.check_abort()
    }

    /// Drain the queue, join the worker and report any error it hit.
    pub fn complete(self) -> Result<(), Error> {
        let Self {
            handle,
            input,
            abort,
            name,
        } = self;

        drop(input);
        let join_result = handle.join();

        if let Some(message) = &*abort.lock().unwrap() {
            bail!("{}: {}", name, message);
        }
        if let Err(panic) = join_result {
            match panic.downcast::<&str>() {
                Ok(panic_msg) => bail!("thread {} paniced: {}", name, panic_msg),
                Err(_) => bail!("thread {} paniced", name),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn jobs_are_processed_in_order() -> Result<(), Error> {
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let pipeline = CopyPipeline::new("test writer", 2, move |job: u64| {
            // Slow consumer to exercise the back-pressure path.
            std::thread::sleep(Duration::from_millis(1));
            sink.lock().unwrap().push(job);
            Ok(())
        })?;

        for job in 0..20u64 {
            pipeline.send(job)?;
        }
        pipeline.flush()?;
        assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<u64>>());

        for job in 20..30u64 {
            pipeline.send(job)?;
        }
        pipeline.complete()?;
        assert_eq!(*seen.lock().unwrap(), (0..30).collect::<Vec<u64>>());
        Ok(())
    }

    #[test]
    fn worker_error_aborts_the_pipeline() -> Result<(), Error> {
        let processed = Arc::new(Mutex::new(0u64));

        let counter = Arc::clone(&processed);
        let pipeline = CopyPipeline::new("test writer", 2, move |job: u64| {
            if job == 3 {
                bail!("write error on job {}", job);
            }
            *counter.lock().unwrap() += 1;
            Ok(())
        })?;

        for job in 0..10u64 {
            if pipeline.send(job).is_err() {
                break;
            }
        }
        let flush_result = pipeline.flush();
        let err = flush_result.and(pipeline.complete()).unwrap_err();
        assert!(err.to_string().contains("write error on job 3"));

        // Jobs after the failing one were drained, not processed.
        assert_eq!(*processed.lock().unwrap(), 3);
        Ok(())
    }
}
