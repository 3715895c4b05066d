//  METHOD.rs
//    by Lut99
//
//  Created:
//    15 Mar 2024, 11:28:40
//  Last edited:
//    31 Jul 2024, 13:47:33
//  Auto updated?
//    Yes
//
//  Description:
//!   Implements the MethodDispatcher, the per-(servable, method)
//!   scheduler at the heart of the master. It splits incoming requests
//!   into per-instance tasks, packs batches, selects workers by
//!   credit-weighted round-robin and reassembles the per-instance
//!   results into ordered replies.
//

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, error, info};
use specifications::serving::{ErrorMsg, Instance, PredictReply, PredictRequest, ServableSpec, StatusCode};
use specifications::working::MethodInfo;

use crate::context::WorkerContext;
use crate::errors::DispatchError;
use crate::spec::{PredictOnFinish, WorkerStatus};


/***** HELPER STRUCTS *****/
/// One per-instance unit of work inside a [`Job`].
struct Task {
    /// The input instance, as taken from the request.
    input:  Instance,
    /// The output instance, once a worker produced it.
    output: Option<Instance>,
    /// The (non-)error of this task, once a worker produced it.
    error:  ErrorMsg,
    /// The pid of the worker currently processing this task, or 0 if it is queued or finalized.
    pid:    u64,
    /// Whether this task has been finalized.
    done:   bool,
}

/// One accepted request, with its tasks and its one-shot completion callback.
struct Job {
    /// The spec of the original request, echoed in the reply.
    spec:      ServableSpec,
    /// The tasks of this job, in request-instance order.
    tasks:     Vec<Task>,
    /// How many tasks have not been finalized yet. The job completes when this hits 0.
    remaining: usize,
    /// The completion callback. Taken out exactly once.
    callback:  Option<PredictOnFinish>,
}

/// The state of a [`MethodDispatcher`], all of it behind one mutex.
struct MethodState {
    /// The workers that take part in this method, by pid.
    workers: BTreeMap<u64, Arc<WorkerContext>>,
    /// The remaining credits of every worker, by pid.
    credits: BTreeMap<u64, i64>,
    /// The pid selected by the previous scheduling round, for fairness among equally loaded peers.
    last_pid: u64,

    /// The queue of `(job id, task index)` pairs waiting to be dispatched.
    task_wait_queue: VecDeque<(u64, usize)>,
    /// The accepted jobs, by job id.
    jobs: HashMap<u64, Job>,
    /// The id handed to the next accepted job.
    next_job_id: u64,
}





/***** LIBRARY *****/
/// The per-(servable, method) scheduler.
///
/// All state lives under a single mutex; worker RPCs are issued outside of it, so the scheduler never blocks on network I/O. Clones share the
/// same state, so the scheduler can hand copies of itself to its own completion callbacks.
#[derive(Clone)]
pub struct MethodDispatcher {
    /// The (servable, version, method) triplet this scheduler serves. Also the spec stamped on sub-requests.
    spec: ServableSpec,
    /// The method's signature, used to validate incoming instances.
    method: MethodInfo,
    /// The batch size every worker of this method declared.
    batch_size: u64,
    /// The initial credit handed to every worker.
    round: i64,
    /// The state, all of it behind one mutex.
    state: Arc<Mutex<MethodState>>,
}

impl MethodDispatcher {
    /// Constructor for the MethodDispatcher.
    ///
    /// # Arguments
    /// - `servable_name`: The name of the servable this scheduler belongs to.
    /// - `version_number`: The version of the servable this scheduler belongs to.
    /// - `method`: The method (name plus input signature) this scheduler serves.
    /// - `batch_size`: The batch size the servable's workers declared.
    /// - `round`: The initial credit handed to every worker.
    ///
    /// # Returns
    /// A new MethodDispatcher instance.
    pub fn new(servable_name: impl Into<String>, version_number: u64, method: MethodInfo, batch_size: u64, round: i64) -> Self {
        Self {
            spec: ServableSpec { name: servable_name.into(), version_number, method_name: method.name.clone() },
            method,
            batch_size,
            round,
            state: Arc::new(Mutex::new(MethodState {
                workers: BTreeMap::new(),
                credits: BTreeMap::new(),
                last_pid: 0,
                task_wait_queue: VecDeque::new(),
                jobs: HashMap::new(),
                next_job_id: 1,
            })),
        }
    }

    /// Accepts a request: validates it, splits it into per-instance tasks and schedules them.
    ///
    /// The completion callback is invoked exactly once, either here (on validation failure) or once the last task has been finalized.
    ///
    /// # Arguments
    /// - `request`: The request to accept.
    /// - `on_finish`: The completion callback to invoke with the assembled reply.
    pub fn push_request(&self, request: PredictRequest, on_finish: PredictOnFinish) {
        let repr: String = request.spec.repr();

        // Every instance must carry every input the method declares
        for (idx, instance) in request.instances.iter().enumerate() {
            for input in &self.method.input_names {
                if !instance.items.contains_key(input) {
                    let err = DispatchError::MissingInput { repr: repr.clone(), instance: idx, input: input.clone() };
                    error!("{err}");
                    on_finish(PredictReply { spec: request.spec.clone(), instances: vec![], error_msg: vec![err.to_error_msg()] });
                    return;
                }
            }
        }

        // A request without instances has nothing to wait for
        if request.instances.is_empty() {
            on_finish(PredictReply { spec: request.spec, instances: vec![], error_msg: vec![] });
            return;
        }

        {
            let mut state: MutexGuard<MethodState> = self.state.lock().unwrap();
            if state.workers.is_empty() {
                drop(state);
                let err = DispatchError::ServableNotAvailable { repr };
                error!("{err}");
                on_finish(PredictReply { spec: request.spec, instances: vec![], error_msg: vec![err.to_error_msg()] });
                return;
            }

            // Allocate the job and enqueue one task per instance
            let job_id: u64 = state.next_job_id;
            state.next_job_id += 1;
            let tasks: Vec<Task> = request
                .instances
                .into_iter()
                .map(|input| Task { input, output: None, error: ErrorMsg::ok(), pid: 0, done: false })
                .collect();
            let remaining: usize = tasks.len();
            for idx in 0..remaining {
                state.task_wait_queue.push_back((job_id, idx));
            }
            state.jobs.insert(job_id, Job { spec: request.spec, tasks, remaining, callback: Some(on_finish) });
            debug!("Accepted job {job_id} ({remaining} task(s)) for {}", self.spec.repr());
        }

        self.schedule();
    }

    /// The scheduling loop: repeatedly packs a batch from the head of the queue and fires it at a selected worker, until the queue is empty or
    /// no credit is available.
    ///
    /// The mutex is held for state inspection only; the RPC itself is issued on a fresh task.
    pub fn schedule(&self) {
        loop {
            // Pop a batch under the lock
            let (worker, chosen, sub_request): (Arc<WorkerContext>, Vec<(u64, usize)>, PredictRequest) = {
                let mut state: MutexGuard<MethodState> = self.state.lock().unwrap();
                if state.task_wait_queue.is_empty() {
                    return;
                }
                let pid: u64 = match Self::select_worker(&mut state) {
                    Some(pid) => pid,
                    None => return,
                };

                let mut chosen: Vec<(u64, usize)> = Vec::with_capacity(self.batch_size as usize);
                let mut instances: Vec<Instance> = Vec::with_capacity(self.batch_size as usize);
                while (chosen.len() as u64) < self.batch_size {
                    let (job_id, task_idx): (u64, usize) = match state.task_wait_queue.pop_front() {
                        Some(entry) => entry,
                        None => break,
                    };
                    if let Some(job) = state.jobs.get_mut(&job_id) {
                        let task: &mut Task = &mut job.tasks[task_idx];
                        task.pid = pid;
                        instances.push(task.input.clone());
                        chosen.push((job_id, task_idx));
                    }
                }
                if chosen.is_empty() {
                    // Nothing popped after all; give the credit back
                    if let Some(credit) = state.credits.get_mut(&pid) {
                        *credit += 1;
                    }
                    return;
                }

                let worker: Arc<WorkerContext> = match state.workers.get(&pid) {
                    Some(worker) => worker.clone(),
                    None => continue,
                };
                (worker, chosen, PredictRequest { spec: self.spec.clone(), instances })
            };

            // Fire the RPC outside the lock. A synchronous refusal is folded into a WorkerUnavailable sub-reply so the completion path below
            // handles both shapes the same way.
            let this: Self = self.clone();
            tokio::spawn(async move {
                let reply: PredictReply = match worker.dispatch(sub_request).await {
                    Ok(reply) => reply,
                    Err(err) => PredictReply::failed(this.spec.clone(), StatusCode::WorkerUnavailable, err.to_string()),
                };
                this.on_sub_done(&worker, chosen, reply);
            });
        }
    }

    /// Selects the worker for the next batch: round-robin, weighted by available credit.
    ///
    /// Workers without credit are skipped. Among the rest the highest credit wins; ties go to the first pid strictly greater than the previously
    /// selected one (wrapping), so idle workers are preferred while equally loaded peers take turns.
    ///
    /// # Returns
    /// The selected pid, with its credit already taken, or [`None`] if every credit is 0.
    fn select_worker(state: &mut MethodState) -> Option<u64> {
        let mut best: Option<(u64, i64)> = None;
        for (&pid, &credit) in &state.credits {
            if credit <= 0 {
                continue;
            }
            match best {
                None => best = Some((pid, credit)),
                Some((best_pid, best_credit)) => {
                    if credit > best_credit || (credit == best_credit && best_pid <= state.last_pid && pid > state.last_pid) {
                        best = Some((pid, credit));
                    }
                },
            }
        }

        let (pid, _): (u64, i64) = best?;
        if let Some(credit) = state.credits.get_mut(&pid) {
            *credit -= 1;
        }
        state.last_pid = pid;
        Some(pid)
    }

    /// Completion path for one batch: refunds the worker's credit, writes back per-task results and fires the callbacks of completed jobs.
    ///
    /// A sub-reply carrying the `WorkerUnavailable` code means the worker went away mid-flight: the whole batch is re-queued at the head of the
    /// queue (order preserved) for another worker to pick up, and the worker is reported to the registry.
    ///
    /// # Arguments
    /// - `worker`: The worker the batch was sent to.
    /// - `chosen`: The `(job id, task index)` pairs of the batch, in sub-request order.
    /// - `reply`: The sub-reply (possibly synthesized) the worker produced.
    fn on_sub_done(&self, worker: &Arc<WorkerContext>, chosen: Vec<(u64, usize)>, reply: PredictReply) {
        let worker_unavailable: bool = reply.has_code(StatusCode::WorkerUnavailable);
        let mut completed: Vec<(PredictOnFinish, PredictReply)> = vec![];
        {
            let mut state: MutexGuard<MethodState> = self.state.lock().unwrap();

            // Refund the credit, unless the worker has been dropped (or broke) in the meantime
            if state.workers.contains_key(&worker.pid()) && worker.status() == WorkerStatus::Ready {
                if let Some(credit) = state.credits.get_mut(&worker.pid()) {
                    *credit += 1;
                }
            }

            if worker_unavailable {
                // The worker went away; put the batch back in front so another worker picks it up
                info!("Worker {} unavailable, re-queueing {} task(s) of {}", worker.pid(), chosen.len(), self.spec.repr());
                for &(job_id, task_idx) in chosen.iter().rev() {
                    if let Some(job) = state.jobs.get_mut(&job_id) {
                        let task: &mut Task = &mut job.tasks[task_idx];
                        if !task.done && task.pid == worker.pid() {
                            task.pid = 0;
                            state.task_wait_queue.push_front((job_id, task_idx));
                        }
                    }
                }
            } else {
                // Decompose the reply into per-task (output, error) pairs and write them back
                let (outputs, errors): (Vec<Option<Instance>>, Vec<ErrorMsg>) = Self::decompose_reply(&self.spec, reply, chosen.len());
                for (i, &(job_id, task_idx)) in chosen.iter().enumerate() {
                    let job: &mut Job = match state.jobs.get_mut(&job_id) {
                        Some(job) => job,
                        None => {
                            error!("Sub-reply for unknown job {job_id}");
                            continue;
                        },
                    };
                    let task: &mut Task = &mut job.tasks[task_idx];
                    if task.done || task.pid != worker.pid() {
                        // Already re-queued (or finalized) through worker removal; the fresh dispatch owns the result now
                        continue;
                    }
                    task.pid = 0;
                    task.output = outputs[i].clone();
                    task.error = errors[i].clone();
                    task.done = true;
                    job.remaining -= 1;
                    if job.remaining == 0 {
                        if let Some(job) = state.jobs.remove(&job_id) {
                            if let Some(entry) = Self::finish_job(job) {
                                completed.push(entry);
                            }
                        }
                    }
                }
            }
        }

        // The lock is gone; now run the side effects
        if worker_unavailable {
            worker.notify_not_available();
        }
        for (callback, reply) in completed {
            callback(reply);
        }
        self.schedule();
    }

    /// Splits a sub-reply into one `(output, error)` pair per sent instance, applying the wire conventions: an empty `error_msg` means all
    /// succeeded, a single entry applies to every instance, and a full-length array maps index-for-index. Anything else (including an
    /// instance-count mismatch) is a malformed reply and yields a per-task system error.
    fn decompose_reply(spec: &ServableSpec, reply: PredictReply, expected: usize) -> (Vec<Option<Instance>>, Vec<ErrorMsg>) {
        let PredictReply { instances, error_msg, .. } = reply;

        // Reject replies whose shape we cannot correlate
        let count_mismatch: bool = !instances.is_empty() && instances.len() != expected;
        let error_mismatch: bool = error_msg.len() > 1 && error_msg.len() != expected;
        if count_mismatch || error_mismatch {
            let err = DispatchError::ReplyCountMismatch { expected, got: if count_mismatch { instances.len() } else { error_msg.len() } };
            error!("{}, {}", err, spec.repr());
            let error: ErrorMsg = err.to_error_msg();
            return (vec![None; expected], vec![error; expected]);
        }

        let mut outputs: Vec<Option<Instance>> = Vec::with_capacity(expected);
        let mut errors: Vec<ErrorMsg> = Vec::with_capacity(expected);
        for i in 0..expected {
            outputs.push(instances.get(i).cloned());
            errors.push(match error_msg.len() {
                0 => ErrorMsg::ok(),
                1 => error_msg[0].clone(),
                _ => error_msg[i].clone(),
            });
        }
        (outputs, errors)
    }

    /// Assembles the reply of a completed job and takes out its one-shot callback.
    ///
    /// Reply instances keep the order of the original request. A job in which nothing succeeded collapses into a single request-wide error
    /// entry; mixed results keep parallel `instances`/`error_msg` arrays.
    fn finish_job(mut job: Job) -> Option<(PredictOnFinish, PredictReply)> {
        let callback: PredictOnFinish = job.callback.take()?;

        let all_ok: bool = job.tasks.iter().all(|t| t.error.is_ok());
        let none_ok: bool = job.tasks.iter().all(|t| !t.error.is_ok());
        let reply: PredictReply = if all_ok {
            PredictReply {
                spec: job.spec,
                instances: job.tasks.into_iter().map(|t| t.output.unwrap_or_default()).collect(),
                error_msg: vec![],
            }
        } else if none_ok {
            // Nothing succeeded; report the first error request-wide
            let error: ErrorMsg = job.tasks.into_iter().map(|t| t.error).next().unwrap_or_else(ErrorMsg::ok);
            PredictReply { spec: job.spec, instances: vec![], error_msg: vec![error] }
        } else {
            let mut instances: Vec<Instance> = Vec::with_capacity(job.tasks.len());
            let mut error_msg: Vec<ErrorMsg> = Vec::with_capacity(job.tasks.len());
            for task in job.tasks {
                instances.push(task.output.unwrap_or_default());
                error_msg.push(task.error);
            }
            PredictReply { spec: job.spec, instances, error_msg }
        };
        Some((callback, reply))
    }

    /// Adds a worker to this method's pool and seeds its credits.
    ///
    /// # Arguments
    /// - `worker`: The worker to add.
    ///
    /// # Errors
    /// This function errors if a worker with the same pid is already part of the pool.
    pub fn add_worker(&self, worker: Arc<WorkerContext>) -> Result<(), DispatchError> {
        {
            let mut state: MutexGuard<MethodState> = self.state.lock().unwrap();
            let pid: u64 = worker.pid();
            if state.workers.contains_key(&pid) {
                return Err(DispatchError::WorkerExists { pid });
            }
            state.workers.insert(pid, worker);
            state.credits.insert(pid, self.round);
        }

        // Any waiting tasks can now run
        self.schedule();
        Ok(())
    }

    /// Removes a worker from this method's pool.
    ///
    /// Tasks that were in flight on the removed worker are re-queued; if the pool becomes empty, every outstanding job is completed with the
    /// stopped-servable error instead.
    ///
    /// # Arguments
    /// - `pid`: The pid of the worker to remove.
    pub fn remove_worker(&self, pid: u64) {
        let mut completed: Vec<(PredictOnFinish, PredictReply)> = vec![];
        {
            let mut state: MutexGuard<MethodState> = self.state.lock().unwrap();
            if state.workers.remove(&pid).is_none() {
                debug!("Worker {pid} was not part of {}", self.spec.repr());
                return;
            }
            state.credits.remove(&pid);

            // Re-queue whatever the worker still had in flight
            let mut orphans: Vec<(u64, usize)> = vec![];
            for (job_id, job) in &state.jobs {
                for (task_idx, task) in job.tasks.iter().enumerate() {
                    if !task.done && task.pid == pid {
                        orphans.push((*job_id, task_idx));
                    }
                }
            }
            for &(job_id, task_idx) in &orphans {
                if let Some(job) = state.jobs.get_mut(&job_id) {
                    job.tasks[task_idx].pid = 0;
                }
                state.task_wait_queue.push_back((job_id, task_idx));
            }
            if !orphans.is_empty() {
                info!("Re-queued {} task(s) that were in flight on removed worker {pid}", orphans.len());
            }

            if state.workers.is_empty() {
                completed = Self::fail_all(&mut state);
            }
        }

        for (callback, reply) in completed {
            callback(reply);
        }
        self.schedule();
    }

    /// Completes every outstanding job with the stopped-servable error and resets the queues. Stored callbacks are taken out, so each fires
    /// exactly once.
    fn fail_all(state: &mut MethodState) -> Vec<(PredictOnFinish, PredictReply)> {
        let mut completed: Vec<(PredictOnFinish, PredictReply)> = vec![];
        for (_, mut job) in state.jobs.drain() {
            let repr: String = job.spec.repr();
            for task in &mut job.tasks {
                if !task.done {
                    task.pid = 0;
                    task.done = true;
                    task.error = DispatchError::ServableNotAvailable { repr: repr.clone() }.to_error_msg();
                }
            }
            job.remaining = 0;
            if let Some(entry) = Self::finish_job(job) {
                completed.push(entry);
            }
        }
        state.task_wait_queue.clear();
        completed
    }

    /// Shuts this scheduler down: every outstanding job is completed with the stopped-servable error and the queues are emptied.
    pub fn clear(&self) {
        let completed: Vec<(PredictOnFinish, PredictReply)> = {
            let mut state: MutexGuard<MethodState> = self.state.lock().unwrap();
            Self::fail_all(&mut state)
        };
        for (callback, reply) in completed {
            callback(reply);
        }
    }

    /// Returns the name of the method this scheduler serves.
    #[inline]
    pub fn method_name(&self) -> &str { &self.method.name }

    /// Returns the signature of the method this scheduler serves.
    #[inline]
    pub fn method_info(&self) -> &MethodInfo { &self.method }
}
