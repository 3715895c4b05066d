//  SPEC.rs
//    by Lut99
//
//  Created:
//    15 Mar 2024, 09:20:55
//  Last edited:
//    31 Jul 2024, 10:06:48
//  Auto updated?
//    Yes
//
//  Description:
//!   Defines (public) interfaces and structs for the `servitor-mst`
//!   crate.
//

use std::time::Duration;

use enum_debug::EnumDebug;
use specifications::serving::PredictReply;


/***** CONSTANTS *****/
/// The default number of concurrent predict calls the master may have in flight to one worker.
pub const DEFAULT_CREDIT_ROUND: i64 = 3;

/// The default soft cap on the number of requests that may be pending in the master at once.
pub const DEFAULT_MAX_ENQUEUED_REQUESTS: u32 = 10000;





/***** LIBRARY *****/
/// The completion callback a frontend hands to the dispatcher together with a request.
///
/// It is invoked exactly once, on the runtime that completes the last outstanding task of the request.
pub type PredictOnFinish = Box<dyn FnOnce(PredictReply) + Send + 'static>;



/// The lifecycle status of a registered worker.
#[derive(Clone, Copy, Debug, EnumDebug, Eq, PartialEq)]
#[repr(u8)]
pub enum WorkerStatus {
    /// The worker process is not (or no longer) alive.
    NotAlive = 0,
    /// The worker process exists but has not completed its `Register` call yet.
    Starting = 1,
    /// The worker is registered and accepts predict calls.
    Ready = 2,
    /// The worker said a clean goodbye.
    NotifyExit = 3,
    /// The worker reported a start-up error or crash.
    NotifyFailed = 4,
    /// The worker reported back-pressure or an in-flight health failure.
    NotAvailable = 5,
}
impl WorkerStatus {
    /// Re-interprets the given discriminant as a WorkerStatus.
    ///
    /// # Returns
    /// The matching status, or [`WorkerStatus::NotAlive`] for discriminants that are out of range.
    #[inline]
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Starting,
            2 => Self::Ready,
            3 => Self::NotifyExit,
            4 => Self::NotifyFailed,
            5 => Self::NotAvailable,
            _ => Self::NotAlive,
        }
    }
}



/// The events a [`WorkerContext`](crate::context::WorkerContext) reports back to the registry that owns it.
///
/// The registry pumps these on a background task, so a scheduler that discovers a broken worker mid-dispatch never has to reach back up into
/// registry state itself.
#[derive(Clone, Copy, Debug, EnumDebug, Eq, PartialEq)]
pub enum WorkerEvent {
    /// The worker with the given pid reported back-pressure or an in-flight health failure.
    NotAvailable(u64),
    /// The worker with the given pid stopped answering liveness probes (or its process died).
    NotAlive(u64),
}



/// Configuration for the heart-beat watcher (see the `heartbeat` module).
#[derive(Clone, Copy, Debug)]
pub struct HeartbeatConfig {
    /// The total time a worker may remain silent before it is given up on.
    pub max_time_out:   Duration,
    /// The number of consecutive probes that must time out before a worker is given up on. The probe interval is `max_time_out / max_ping_times`.
    pub max_ping_times: u32,
    /// The deadline carried by every individual ping.
    pub ping_deadline:  Duration,
}
impl Default for HeartbeatConfig {
    #[inline]
    fn default() -> Self { Self { max_time_out: Duration::from_secs(10), max_ping_times: 10, ping_deadline: Duration::from_micros(100) } }
}
