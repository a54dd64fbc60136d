// =============================================================================
// Signal queuer — derives external signals from the tracked video catalogue
// =============================================================================
//
// Two paths, both idempotent through the signal uniqueness key
// (source, ticker, signal, mode, execute-on date, video):
//
//   Daily path    — today's daily-signal videos become fully-priced signals
//                   (trigger, stop, first target) at confidence 8.
//   Generic path  — scanner candidates are queued once per applicable
//                   generic-strategy video with NO price levels, forcing the
//                   full-analysis gate at execution time. Tickers claimed
//                   here are skipped by the residual scanner step.
// =============================================================================

use std::collections::HashSet;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::datastore::{Datastore, SignalKey};
use crate::services::signals::{ScanResults, TradeIdea};
use crate::types::{
    ExternalStrategySignal, SignalStatus, StrategyType, StrategyVideo, TradeMode, TradeSignal,
};

/// Confidence assigned to daily-signal setups (the video called the exact
/// levels; the extraction already filtered weak ones).
const DAILY_SIGNAL_CONFIDENCE: u8 = 8;

/// Notes prefix that marks auto-queued generic signals; the duplicate-ticker
/// gate and allocation split key off it.
pub const GENERIC_AUTO_PREFIX: &str = "Generic strategy auto";

pub struct SignalQueuer<'a> {
    pub datastore: &'a dyn Datastore,
}

impl<'a> SignalQueuer<'a> {
    pub fn new(datastore: &'a dyn Datastore) -> Self {
        Self { datastore }
    }

    // -------------------------------------------------------------------------
    // Daily-signal path
    // -------------------------------------------------------------------------

    /// Queue signals for every tracked daily-signal video dated `today`.
    /// Returns how many new signals were created.
    pub async fn queue_daily_signals(
        &self,
        videos: &[StrategyVideo],
        today: NaiveDate,
    ) -> Result<u32> {
        let mut queued = 0u32;

        for video in videos {
            if !video.is_tracked()
                || video.strategy_type != StrategyType::DailySignal
                || video.trade_date != Some(today)
                || video.extracted_signals.is_empty()
            {
                continue;
            }

            let mode = video.timeframe.unwrap_or(TradeMode::DayTrade);

            for setup in &video.extracted_signals {
                if let (Some(trigger), Some(target)) =
                    (setup.long_trigger_above, setup.long_targets.first())
                {
                    queued += self
                        .queue_one(
                            video,
                            &setup.ticker,
                            TradeSignal::Buy,
                            mode,
                            today,
                            Some(trigger),
                            setup.short_trigger_below,
                            Some(*target),
                        )
                        .await? as u32;
                }
                if let (Some(trigger), Some(target)) =
                    (setup.short_trigger_below, setup.short_targets.first())
                {
                    queued += self
                        .queue_one(
                            video,
                            &setup.ticker,
                            TradeSignal::Sell,
                            mode,
                            today,
                            Some(trigger),
                            setup.long_trigger_above,
                            Some(*target),
                        )
                        .await? as u32;
                }
            }
        }

        if queued > 0 {
            info!(queued, "daily video signals queued");
        }
        Ok(queued)
    }

    // -------------------------------------------------------------------------
    // Generic-strategy path
    // -------------------------------------------------------------------------

    /// Queue scanner candidates against every applicable generic-strategy
    /// video. Returns the set of tickers claimed by this path (inserted now
    /// or already present), which the residual scanner step must skip.
    pub async fn queue_generic_signals(
        &self,
        scan: &ScanResults,
        videos: &[StrategyVideo],
        active_tickers: &HashSet<String>,
        min_confidence: f64,
        today: NaiveDate,
    ) -> Result<HashSet<String>> {
        let mut claimed = HashSet::new();

        for (mode, ideas) in [
            (TradeMode::DayTrade, &scan.day_trades),
            (TradeMode::SwingTrade, &scan.swing_trades),
        ] {
            let applicable: Vec<&StrategyVideo> = videos
                .iter()
                .filter(|v| v.is_tracked() && v.strategy_type == StrategyType::GenericStrategy)
                .filter(|v| {
                    if v.applicable_timeframes.is_empty() {
                        v.timeframe == Some(mode)
                    } else {
                        v.applicable_timeframes.contains(&mode)
                    }
                })
                .collect();
            if applicable.is_empty() {
                continue;
            }

            let mut candidates: Vec<&TradeIdea> = ideas
                .iter()
                .filter(|idea| idea.confidence >= min_confidence)
                .collect();
            candidates.sort_by(|a, b| {
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            for idea in candidates {
                if active_tickers.contains(&idea.ticker) {
                    debug!(ticker = %idea.ticker, "generic queue skipping active ticker");
                    continue;
                }

                let mut ticker_claimed = false;
                for video in &applicable {
                    let created = self
                        .queue_generic_one(video, idea, mode, today)
                        .await?;
                    ticker_claimed |= created;
                }
                if ticker_claimed {
                    claimed.insert(idea.ticker.clone());
                }
            }
        }

        if !claimed.is_empty() {
            info!(count = claimed.len(), "tickers claimed by generic-strategy queue");
        }
        Ok(claimed)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Insert one signal unless its key already exists. Returns whether the
    /// key now exists (inserted or found).
    #[allow(clippy::too_many_arguments)]
    async fn queue_one(
        &self,
        video: &StrategyVideo,
        ticker: &str,
        signal: TradeSignal,
        mode: TradeMode,
        execute_on_date: NaiveDate,
        entry_price: Option<f64>,
        stop_loss: Option<f64>,
        target_price: Option<f64>,
    ) -> Result<bool> {
        let source_name = video.source_label();
        let key = SignalKey {
            source_name: &source_name,
            ticker,
            signal,
            mode,
            execute_on_date,
            strategy_video_id: Some(&video.video_id),
        };
        if self.datastore.find_signal(&key).await?.is_some() {
            return Ok(false);
        }

        let record = ExternalStrategySignal {
            id: Uuid::new_v4().to_string(),
            source_name: source_name.clone(),
            source_url: video.canonical_url.clone(),
            strategy_video_id: Some(video.video_id.clone()),
            strategy_video_heading: video.video_heading.clone(),
            ticker: ticker.to_string(),
            signal,
            mode,
            confidence: DAILY_SIGNAL_CONFIDENCE,
            entry_price,
            stop_loss,
            target_price,
            position_size_override: None,
            execute_on_date,
            execute_at: None,
            expires_at: None,
            notes: video
                .video_heading
                .as_ref()
                .map(|h| format!("Daily signal from \"{h}\"")),
            status: SignalStatus::Pending,
            failure_reason: None,
            executed_trade_id: None,
            executed_at: None,
            created_at: Utc::now(),
        };
        self.datastore.insert_signal(&record).await?;
        debug!(ticker, signal = %signal, video = %video.video_id, "daily signal queued");
        Ok(true)
    }

    /// Insert a level-less generic signal for `idea` against `video`.
    /// Returns whether the key now exists (inserted or found).
    async fn queue_generic_one(
        &self,
        video: &StrategyVideo,
        idea: &TradeIdea,
        mode: TradeMode,
        today: NaiveDate,
    ) -> Result<bool> {
        let source_name = video.source_label();
        let key = SignalKey {
            source_name: &source_name,
            ticker: &idea.ticker,
            signal: idea.signal,
            mode,
            execute_on_date: today,
            strategy_video_id: Some(&video.video_id),
        };
        if self.datastore.find_signal(&key).await?.is_some() {
            // Already queued today — still counts as claimed.
            return Ok(true);
        }

        let confidence = (idea.confidence.round() as i64).clamp(1, 10) as u8;
        let record = ExternalStrategySignal {
            id: Uuid::new_v4().to_string(),
            source_name: source_name.clone(),
            source_url: video.canonical_url.clone(),
            strategy_video_id: Some(video.video_id.clone()),
            strategy_video_heading: video.video_heading.clone(),
            ticker: idea.ticker.clone(),
            signal: idea.signal,
            mode,
            confidence,
            // No levels on purpose: execution must pass the full-analysis
            // gate and adopt its levels.
            entry_price: None,
            stop_loss: None,
            target_price: None,
            position_size_override: None,
            execute_on_date: today,
            execute_at: None,
            expires_at: None,
            notes: Some(format!(
                "{GENERIC_AUTO_PREFIX}: scanner {:.1} for {}",
                idea.confidence,
                video.video_heading.as_deref().unwrap_or(&video.video_id)
            )),
            status: SignalStatus::Pending,
            failure_reason: None,
            executed_trade_id: None,
            executed_at: None,
            created_at: Utc::now(),
        };
        self.datastore.insert_signal(&record).await?;
        debug!(
            ticker = %idea.ticker,
            video = %video.video_id,
            confidence,
            "generic strategy signal queued"
        );
        Ok(true)
    }
}
