//! Per-statement instrumentation.
//!
//! Adapters time every `query` and `exec_raw` call and hand the result to an
//! optional [`QueryObserver`]. Without one the event is logged at `trace`.

use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{Backend, DatabaseError};

#[derive(Debug, Clone, Copy)]
pub struct QueryEvent<'a> {
    pub backend: Backend,
    pub sql: &'a str,
    pub param_count: usize,
    pub elapsed: Duration,
    pub succeeded: bool,
    pub in_transaction: bool,
}

pub trait QueryObserver: Send + Sync {
    fn on_query(&self, event: &QueryEvent<'_>);
}

impl<F> QueryObserver for F
where
    F: Fn(&QueryEvent<'_>) + Send + Sync,
{
    fn on_query(&self, event: &QueryEvent<'_>) {
        self(event);
    }
}

pub type SharedObserver = Arc<dyn QueryObserver>;

fn report(observer: Option<&SharedObserver>, event: &QueryEvent<'_>) {
    if let Some(observer) = observer {
        observer.on_query(event);
    } else {
        log::trace!(
            "{} query ({} param{}, {}, {:?}{}):\n{}",
            event.backend,
            event.param_count,
            if event.param_count == 1 { "" } else { "s" },
            if event.succeeded { "ok" } else { "failed" },
            event.elapsed,
            if event.in_transaction { ", tx" } else { "" },
            event.sql,
        );
    }
}

pub(crate) struct Timing<'a> {
    pub observer: Option<&'a SharedObserver>,
    pub backend: Backend,
    pub sql: &'a str,
    pub param_count: usize,
    pub in_transaction: bool,
}

impl Timing<'_> {
    pub(crate) async fn run<T, F>(self, fut: F) -> Result<T, DatabaseError>
    where
        F: Future<Output = Result<T, DatabaseError>> + Send,
    {
        let start = Instant::now();
        let result = fut.await;
        report(
            self.observer,
            &QueryEvent {
                backend: self.backend,
                sql: self.sql,
                param_count: self.param_count,
                elapsed: start.elapsed(),
                succeeded: result.is_ok(),
                in_transaction: self.in_transaction,
            },
        );
        result
    }
}
