use crate::engine::clock::Clock;
use crate::forecast::{ForecastError, ForecastSource, ForecastTable};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use time::{Date, PrimitiveDateTime};

#[derive(Debug, Clone, PartialEq)]
pub struct ForecastAttempt {
    pub from_date: Date,
    pub horizon_days: u32,
    pub at: Option<PrimitiveDateTime>,
}

/// Forecast source that replays a scripted sequence of outcomes.
///
/// Once the script is exhausted every further attempt fails with a transport
/// error.
pub struct ScriptedForecastSource {
    script: VecDeque<Result<ForecastTable, ForecastError>>,
    attempts: Arc<Mutex<Vec<ForecastAttempt>>>,
    clock: Option<Arc<dyn Clock>>,
}

impl ScriptedForecastSource {
    pub fn new(script: Vec<Result<ForecastTable, ForecastError>>) -> Self {
        Self {
            script: script.into(),
            attempts: Arc::new(Mutex::new(Vec::new())),
            clock: None,
        }
    }

    /// Fail `failures` times with a transport error, then return `table`.
    pub fn failing_then(failures: usize, table: ForecastTable) -> Self {
        let mut script: Vec<Result<ForecastTable, ForecastError>> = (0..failures)
            .map(|_| Err(ForecastError::Transport("connection refused".to_string())))
            .collect();
        script.push(Ok(table));
        Self::new(script)
    }

    /// Record the clock reading of every attempt.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Shared handle to the attempt log, usable after the source is moved.
    pub fn attempts(&self) -> Arc<Mutex<Vec<ForecastAttempt>>> {
        Arc::clone(&self.attempts)
    }
}

impl ForecastSource for ScriptedForecastSource {
    fn fetch(&mut self, from_date: Date, horizon_days: u32) -> Result<ForecastTable, ForecastError> {
        let attempt = ForecastAttempt {
            from_date,
            horizon_days,
            at: self.clock.as_ref().map(|clock| clock.now()),
        };
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.push(attempt);
        }
        self.script
            .pop_front()
            .unwrap_or_else(|| Err(ForecastError::Transport("script exhausted".to_string())))
    }
}
