//! Per-channel playback session: locators, retry budgets, and the recovery
//! decision for each engine error.

use std::time::Duration;

use tuner_proto::protocol::StartRequest;

use crate::backoff::backoff;
use crate::engine::EngineError;
use crate::error::{PlaybackError, Result};

/// Ceiling for backoff retries on one locator.
pub const MAX_GENERAL_RETRIES: u32 = 5;
/// Ceiling for seek-to-live recoveries on one locator.
pub const MAX_LIVE_WINDOW_RETRIES: u32 = 3;

/// What to do about an engine error, given the session's budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPlan {
    /// Jump back to the live edge and re-prepare right away.
    SeekToLive { attempt: u32 },
    /// Re-prepare after `delay`.
    Wait { attempt: u32, delay: Duration },
    /// Primary budget spent; rebuild the engine on the fallback locator.
    SwitchFallback,
    /// Nothing left to try.
    SurfaceError,
}

#[derive(Debug, Clone)]
pub struct PlaybackSession {
    current_url: String,
    fallback_url: Option<String>,
    channel_label: Option<String>,
    auth_token: Option<String>,
    report_base_url: Option<String>,
    general_retries: u32,
    live_window_retries: u32,
    fallback_used: bool,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl PlaybackSession {
    /// Validate a start request.  Blank optional fields count as absent.
    pub fn from_request(req: StartRequest) -> Result<Self> {
        let current_url = req.primary_url.trim().to_string();
        if current_url.is_empty() {
            return Err(PlaybackError::InvalidInput(
                "No stream URL provided".to_string(),
            ));
        }
        Ok(Self {
            current_url,
            fallback_url: non_empty(req.fallback_url),
            channel_label: non_empty(req.channel_label),
            auth_token: non_empty(req.auth_token),
            report_base_url: non_empty(req.report_base_url),
            general_retries: 0,
            live_window_retries: 0,
            fallback_used: false,
        })
    }

    pub fn current_url(&self) -> &str {
        &self.current_url
    }

    pub fn channel_label(&self) -> Option<&str> {
        self.channel_label.as_deref()
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    pub fn report_base_url(&self) -> Option<&str> {
        self.report_base_url.as_deref()
    }

    pub fn general_retries(&self) -> u32 {
        self.general_retries
    }

    pub fn live_window_retries(&self) -> u32 {
        self.live_window_retries
    }

    pub fn fallback_used(&self) -> bool {
        self.fallback_used
    }

    /// An unused fallback that differs from the locator in play.
    pub fn fallback_available(&self) -> bool {
        !self.fallback_used
            && self
                .fallback_url
                .as_deref()
                .is_some_and(|fb| fb != self.current_url)
    }

    /// Decide how to react to `err`.  Pure: budgets are only spent by the
    /// matching `record_*` call.
    pub fn plan_recovery(&self, err: &EngineError) -> RetryPlan {
        if err.is_behind_live_window() && self.live_window_retries < MAX_LIVE_WINDOW_RETRIES {
            return RetryPlan::SeekToLive {
                attempt: self.live_window_retries + 1,
            };
        }
        // a behind-live error past its own budget falls through to the
        // general schedule
        if self.general_retries < MAX_GENERAL_RETRIES {
            let attempt = self.general_retries + 1;
            return RetryPlan::Wait {
                attempt,
                delay: backoff(attempt),
            };
        }
        if self.fallback_available() {
            RetryPlan::SwitchFallback
        } else {
            RetryPlan::SurfaceError
        }
    }

    pub fn record_live_window_retry(&mut self) -> u32 {
        self.live_window_retries = (self.live_window_retries + 1).min(MAX_LIVE_WINDOW_RETRIES);
        self.live_window_retries
    }

    pub fn record_general_retry(&mut self) -> u32 {
        self.general_retries = (self.general_retries + 1).min(MAX_GENERAL_RETRIES);
        self.general_retries
    }

    /// Successful playback earns a fresh budget.
    pub fn reset_retries(&mut self) {
        self.general_retries = 0;
        self.live_window_retries = 0;
    }

    /// Consume the fallback: it becomes the current locator, the slot is
    /// emptied, and both budgets restart.  Returns the new locator.
    pub fn switch_to_fallback(&mut self) -> Option<&str> {
        if !self.fallback_available() {
            return None;
        }
        let fallback = self.fallback_url.take()?;
        self.current_url = fallback;
        self.fallback_used = true;
        self.reset_retries();
        Some(&self.current_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(primary: &str, fallback: Option<&str>) -> StartRequest {
        StartRequest {
            primary_url: primary.to_string(),
            fallback_url: fallback.map(str::to_string),
            channel_label: Some("News 24".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_primary_is_rejected() {
        for primary in ["", "   "] {
            let err = PlaybackSession::from_request(request(primary, None)).unwrap_err();
            assert_eq!(
                err,
                PlaybackError::InvalidInput("No stream URL provided".to_string())
            );
        }
    }

    #[test]
    fn test_blank_optionals_are_absent() {
        let session = PlaybackSession::from_request(StartRequest {
            primary_url: "http://a/live.m3u8".into(),
            fallback_url: Some("".into()),
            channel_label: Some(" ".into()),
            auth_token: Some("".into()),
            report_base_url: None,
        })
        .unwrap();
        assert!(!session.fallback_available());
        assert!(session.channel_label().is_none());
        assert!(session.auth_token().is_none());
    }

    #[test]
    fn test_general_schedule_then_fallback() {
        let mut session =
            PlaybackSession::from_request(request("http://a", Some("http://b"))).unwrap();
        let err = EngineError::other("HTTP 503");
        for (attempt, secs) in [(1, 1), (2, 2), (3, 4), (4, 8), (5, 8)] {
            assert_eq!(
                session.plan_recovery(&err),
                RetryPlan::Wait {
                    attempt,
                    delay: Duration::from_secs(secs)
                }
            );
            session.record_general_retry();
        }
        assert_eq!(session.plan_recovery(&err), RetryPlan::SwitchFallback);
        assert_eq!(session.switch_to_fallback(), Some("http://b"));
        assert_eq!(session.general_retries(), 0);
        assert!(session.fallback_used());
        assert!(!session.fallback_available());

        for _ in 0..MAX_GENERAL_RETRIES {
            session.record_general_retry();
        }
        assert_eq!(session.plan_recovery(&err), RetryPlan::SurfaceError);
        assert_eq!(session.switch_to_fallback(), None);
    }

    #[test]
    fn test_behind_live_window_budget() {
        let mut session = PlaybackSession::from_request(request("http://a", None)).unwrap();
        let err = EngineError::behind_live_window("expired");
        for attempt in 1..=MAX_LIVE_WINDOW_RETRIES {
            assert_eq!(
                session.plan_recovery(&err),
                RetryPlan::SeekToLive { attempt }
            );
            session.record_live_window_retry();
        }
        // exhausted: handled like any other error
        assert_eq!(
            session.plan_recovery(&err),
            RetryPlan::Wait {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(session.general_retries(), 0);
    }

    #[test]
    fn test_fallback_equal_to_primary_is_not_used() {
        let mut session = PlaybackSession::from_request(request("http://a", Some("http://a"))).unwrap();
        assert!(!session.fallback_available());
        for _ in 0..MAX_GENERAL_RETRIES {
            session.record_general_retry();
        }
        assert_eq!(
            session.plan_recovery(&EngineError::other("boom")),
            RetryPlan::SurfaceError
        );
    }

    #[test]
    fn test_counters_stay_within_ceilings() {
        let mut session = PlaybackSession::from_request(request("http://a", None)).unwrap();
        for _ in 0..10 {
            session.record_general_retry();
            session.record_live_window_retry();
        }
        assert_eq!(session.general_retries(), MAX_GENERAL_RETRIES);
        assert_eq!(session.live_window_retries(), MAX_LIVE_WINDOW_RETRIES);
        session.reset_retries();
        assert_eq!(session.general_retries(), 0);
        assert_eq!(session.live_window_retries(), 0);
    }
}
