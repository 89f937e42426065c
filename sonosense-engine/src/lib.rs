pub mod dispatcher;
pub mod refresher;
pub mod registry;
pub mod sweeper;

#[cfg(test)]
mod testutil;

pub use dispatcher::{DispatchOutcome, MotionDispatcher};
pub use refresher::{RefreshFailure, RefreshSummary, TokenRefresher};
pub use registry::{
    AnalyticsFilter, OpenOrExtend, SessionAnalytics, SessionPage, SessionQuery, SessionRegistry,
};
pub use sweeper::{SweepError, SweepSummary, TimeoutSweeper};
