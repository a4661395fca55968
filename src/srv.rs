//! Background work: the purge worker and a small task queue serving
//! rollbacks and purge batches on worker threads.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info};

use crate::{
    database::Database,
    error::SmallError,
    que::QueThr,
    transaction::{trx_purge, trx_purge_all},
};

/// Runs purge batches every `interval` until stopped.
pub struct PurgeWorker {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<usize>>,
}

impl PurgeWorker {
    pub fn start(db: &Arc<Database>, interval: Duration) -> Self {
        let (stop, stopped) = channel::bounded::<()>(1);
        let db = Arc::clone(db);
        let handle = thread::spawn(move || {
            let mut n_pages = 0;
            loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
                match trx_purge(&db) {
                    Ok(n) => n_pages += n,
                    Err(e) => {
                        error!("purge worker: {}", e);
                        e.show_backtrace();
                    }
                }
            }
            info!("purge worker stopped, {} undo pages freed", n_pages);
            n_pages
        });
        Self {
            stop: Some(stop),
            handle: Some(handle),
        }
    }

    /// Stop the worker and wait for it. Returns the number of undo pages
    /// it freed.
    pub fn stop(mut self) -> usize {
        self.shutdown()
    }

    fn shutdown(&mut self) -> usize {
        // closing the channel wakes the worker up
        self.stop.take();
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or(0),
            None => 0,
        }
    }
}

impl Drop for PurgeWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub enum Task {
    /// Roll back a transaction and hand its thread back.
    Rollback(QueThr),
    Purge,
    PurgeAll,
}

impl Task {
    fn name(&self) -> &'static str {
        match self {
            Task::Rollback(_) => "rollback",
            Task::Purge => "purge",
            Task::PurgeAll => "purge_all",
        }
    }
}

pub struct TaskDone {
    pub name: &'static str,

    /// Undo pages freed by a purge task.
    pub result: Result<usize, SmallError>,

    /// The thread of a rollback task.
    pub thr: Option<QueThr>,
}

/// A fixed set of worker threads taking tasks from one channel.
pub struct TaskQueue {
    tasks: Option<Sender<Task>>,
    done: Receiver<TaskDone>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskQueue {
    pub fn new(db: &Arc<Database>, n_workers: usize) -> Self {
        let (tasks, task_rx) = channel::unbounded::<Task>();
        let (done_tx, done) = channel::unbounded::<TaskDone>();

        let workers = (0..n_workers.max(1))
            .map(|i| {
                let db = Arc::clone(db);
                let task_rx = task_rx.clone();
                let done_tx = done_tx.clone();
                thread::spawn(move || {
                    for task in task_rx.iter() {
                        let name = task.name();
                        debug!("worker {}: {}", i, name);
                        let done = run_task(&db, task, name);
                        if done_tx.send(done).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();

        Self {
            tasks: Some(tasks),
            done,
            workers,
        }
    }

    pub fn submit(&self, task: Task) -> Result<(), SmallError> {
        match &self.tasks {
            Some(tasks) => tasks
                .send(task)
                .map_err(|_| SmallError::internal("task queue workers are gone")),
            None => Err(SmallError::internal("task queue is shut down")),
        }
    }

    /// Wait for the next finished task.
    pub fn recv_done(&self, timeout: Duration) -> Option<TaskDone> {
        self.done.recv_timeout(timeout).ok()
    }

    /// Let the workers drain the queue and exit.
    pub fn shutdown(mut self) -> Vec<TaskDone> {
        self.tasks.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("task queue worker panicked");
            }
        }
        self.done.try_iter().collect()
    }
}

fn run_task(db: &Database, task: Task, name: &'static str) -> TaskDone {
    match task {
        Task::Rollback(mut thr) => {
            let result = thr.rollback(db).map(|_| 0);
            TaskDone {
                name,
                result,
                thr: Some(thr),
            }
        }
        Task::Purge => TaskDone {
            name,
            result: trx_purge(db),
            thr: None,
        },
        Task::PurgeAll => TaskDone {
            name,
            result: trx_purge_all(db),
            thr: None,
        },
    }
}
