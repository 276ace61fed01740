use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;

/// Wall clock abstraction shared by the breaker, the limiters, and anything
/// else that reasons about cooldown windows.
pub trait Clock: Send + Sync {
    fn now_secs(&self) -> i64;

    fn now_millis(&self) -> i64 {
        self.now_secs() * 1000
    }

    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.now_secs(), 0)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> i64 {
        Utc::now().timestamp()
    }

    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub type SharedClock = Arc<dyn Clock>;

pub fn system() -> SharedClock {
    Arc::new(SystemClock)
}

#[cfg(test)]
pub mod manual {
    use super::Clock;
    use std::sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    };

    #[derive(Debug, Clone)]
    pub struct ManualClock {
        millis: Arc<AtomicI64>,
    }

    impl ManualClock {
        pub fn at(secs: i64) -> Self {
            Self {
                millis: Arc::new(AtomicI64::new(secs * 1000)),
            }
        }

        pub fn advance(&self, secs: i64) {
            self.millis.fetch_add(secs * 1000, Ordering::SeqCst);
        }

        pub fn advance_millis(&self, millis: i64) {
            self.millis.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_secs(&self) -> i64 {
            self.now_millis().div_euclid(1000)
        }

        fn now_millis(&self) -> i64 {
            self.millis.load(Ordering::SeqCst)
        }
    }
}
