//! Small worker pool that runs tasks along dependency edges.
//!
//! The calling thread coordinates: it hands ready task indices to a shared
//! job channel and collects results. A task runs only after every task it
//! depends on finished successfully. A failure blocks its dependents and
//! leaves unrelated tasks running. Cancellation stops dispatch, and tasks
//! already handed out run to completion.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Mutex, PoisonError};
use std::thread;

use crate::cancel::CancelToken;

#[derive(Debug)]
pub enum TaskStatus<T, E> {
    Done(T),
    Failed(E),
    /// A dependency failed; the task never ran.
    Blocked,
    /// Cancellation arrived before the task was dispatched.
    Cancelled,
}

impl<T, E> TaskStatus<T, E> {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }
}

/// Run `task(i)` for every `i` in `0..deps.len()`.
///
/// `deps[i]` lists the indices task `i` waits for. Returns one status per
/// task, in index order.
pub fn run<T, E, F>(
    deps: &[Vec<usize>],
    workers: usize,
    cancel: &CancelToken,
    task: F,
) -> Vec<TaskStatus<T, E>>
where
    T: Send,
    E: Send,
    F: Fn(usize) -> Result<T, E> + Sync,
{
    let n = deps.len();
    let mut status: Vec<Option<TaskStatus<T, E>>> = (0..n).map(|_| None).collect();
    if n == 0 {
        return Vec::new();
    }

    let mut remaining: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, d) in deps.iter().enumerate() {
        for &j in d {
            dependents[j].push(i);
        }
    }
    let mut ready: VecDeque<usize> = (0..n).filter(|i| remaining[*i] == 0).collect();

    // Shared with the workers, so it must outlive the scope.
    let (job_tx, job_rx) = mpsc::channel::<usize>();
    let (res_tx, res_rx) = mpsc::channel::<(usize, Result<T, E>)>();
    let job_rx = Mutex::new(job_rx);

    thread::scope(|scope| {
        for _ in 0..workers.clamp(1, n) {
            let job_rx = &job_rx;
            let res_tx = res_tx.clone();
            let task = &task;
            scope.spawn(move || loop {
                let next = job_rx
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .recv();
                let Ok(i) = next else {
                    break;
                };
                if res_tx.send((i, task(i))).is_err() {
                    break;
                }
            });
        }
        drop(res_tx);

        let mut in_flight = 0usize;
        loop {
            if cancel.is_cancelled() {
                for i in ready.drain(..) {
                    status[i] = Some(TaskStatus::Cancelled);
                }
            }
            while let Some(i) = ready.pop_front() {
                if job_tx.send(i).is_err() {
                    status[i] = Some(TaskStatus::Cancelled);
                    continue;
                }
                in_flight += 1;
            }
            if in_flight == 0 {
                break;
            }

            let Ok((i, out)) = res_rx.recv() else {
                break;
            };
            in_flight -= 1;
            match out {
                Ok(value) => {
                    status[i] = Some(TaskStatus::Done(value));
                    for &d in &dependents[i] {
                        remaining[d] -= 1;
                        if remaining[d] == 0 && status[d].is_none() {
                            ready.push_back(d);
                        }
                    }
                }
                Err(e) => {
                    status[i] = Some(TaskStatus::Failed(e));
                    let mut stack = dependents[i].clone();
                    while let Some(d) = stack.pop() {
                        if status[d].is_none() {
                            status[d] = Some(TaskStatus::Blocked);
                            stack.extend(dependents[d].iter().copied());
                        }
                    }
                }
            }
        }
        drop(job_tx);
    });

    status
        .into_iter()
        .map(|s| s.unwrap_or(TaskStatus::Cancelled))
        .collect()
}
