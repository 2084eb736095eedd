//! Risk manager.
//!
//! Portfolio-level circuit breakers and position-sizing policy, consulted
//! by the scanning loop before every entry decision.
//!
//! Drawdown references: the all-time peak balance, the balance at the
//! start of the current UTC day, and the balance at the start of the
//! current ISO week. Emergency state (≥ 30% off peak by default) latches
//! until manually cleared; the caller is responsible for liquidating open
//! bets when the gate first reports it.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::config::RiskSettings;
use crate::types::EngineError;

/// Verdict on whether new entries may proceed this cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryGate {
    /// Entries allowed; sizing is scaled by this factor (1.0 normally,
    /// reduced under weekly drawdown).
    Allowed { size_scale: f64 },
    /// Entries paused; monitoring and settlement keep running.
    Paused { reason: String },
    /// Emergency: liquidate everything, no entries until cleared.
    Emergency,
}

pub struct RiskManager {
    cfg: RiskSettings,
    peak_balance: Decimal,
    day_open: Decimal,
    day: NaiveDate,
    week_open: Decimal,
    week: (i32, u32),
    emergency: bool,
}

fn iso_week(now: DateTime<Utc>) -> (i32, u32) {
    let w = now.iso_week();
    (w.year(), w.week())
}

fn drawdown(reference: Decimal, balance: Decimal) -> f64 {
    if reference <= Decimal::ZERO {
        return 0.0;
    }
    (Decimal::ONE - balance / reference)
        .to_f64()
        .unwrap_or(0.0)
        .max(0.0)
}

impl RiskManager {
    pub fn new(cfg: RiskSettings, balance: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            cfg,
            peak_balance: balance,
            day_open: balance,
            day: now.date_naive(),
            week_open: balance,
            week: iso_week(now),
            emergency: false,
        }
    }

    /// Record the balance at the top of a cycle: rolls the day/week
    /// reference windows and advances the peak.
    pub fn observe(&mut self, balance: Decimal, now: DateTime<Utc>) {
        if now.date_naive() != self.day {
            self.day = now.date_naive();
            self.day_open = balance;
            debug!(day_open = %balance, "Daily drawdown window rolled");
        }
        if iso_week(now) != self.week {
            self.week = iso_week(now);
            self.week_open = balance;
            debug!(week_open = %balance, "Weekly drawdown window rolled");
        }
        if balance > self.peak_balance {
            self.peak_balance = balance;
        }
    }

    /// Circuit-breaker check before any entry decision. Emergency latches.
    pub fn gate(&mut self, balance: Decimal) -> EntryGate {
        let peak_dd = drawdown(self.peak_balance, balance);
        if self.emergency || peak_dd >= self.cfg.emergency_drawdown {
            if !self.emergency {
                warn!(
                    drawdown = format!("{:.1}%", peak_dd * 100.0),
                    "Emergency drawdown reached — latching"
                );
                self.emergency = true;
            }
            return EntryGate::Emergency;
        }

        let daily_dd = drawdown(self.day_open, balance);
        if daily_dd >= self.cfg.daily_pause_drawdown {
            return EntryGate::Paused {
                reason: format!("daily drawdown {:.1}%", daily_dd * 100.0),
            };
        }

        let weekly_dd = drawdown(self.week_open, balance);
        if weekly_dd >= self.cfg.weekly_reduce_drawdown {
            return EntryGate::Allowed { size_scale: 0.5 };
        }

        EntryGate::Allowed { size_scale: 1.0 }
    }

    pub fn is_emergency(&self) -> bool {
        self.emergency
    }

    /// Manual reset of the emergency latch.
    pub fn clear_emergency(&mut self) {
        self.emergency = false;
        warn!("Emergency latch cleared manually");
    }

    /// Position size for one entry:
    /// `base_fraction × volatility_factor × confidence_factor × stake_multiplier`,
    /// clamped to `max_fraction` of balance and to the absolute dollar cap
    /// scaled by the multiplier.
    ///
    /// More volatility shrinks the size; confidence above 60% scales it up
    /// to 1.5×.
    pub fn stake(
        &self,
        balance: Decimal,
        volatility_pct: f64,
        confidence: f64,
        stake_multiplier: f64,
    ) -> Decimal {
        if balance <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let vol_factor = (1.0 / (1.0 + volatility_pct.max(0.0))).clamp(0.2, 1.0);
        let conf_factor = if confidence > 0.60 {
            1.0 + ((confidence - 0.60) / 0.40).min(1.0) * 0.5
        } else {
            1.0
        };

        let fraction = (self.cfg.base_fraction * vol_factor * conf_factor * stake_multiplier)
            .min(self.cfg.max_fraction);
        let fraction = Decimal::from_f64(fraction).unwrap_or(Decimal::ZERO);

        let cap = self.cfg.max_stake_usd
            * Decimal::from_f64(stake_multiplier).unwrap_or(Decimal::ONE);

        (balance * fraction).min(cap).max(Decimal::ZERO)
    }

    /// Exposure caps checked against current portfolio state.
    pub fn check_exposure(
        &self,
        balance: Decimal,
        total_open_cost: Decimal,
        asset_open_cost: Decimal,
        open_bet_count: usize,
    ) -> Result<(), EngineError> {
        if open_bet_count >= self.cfg.max_open_bets {
            return Err(EngineError::RiskLimit(format!(
                "open bet ceiling reached ({open_bet_count}/{})",
                self.cfg.max_open_bets
            )));
        }

        let total_limit = balance * Decimal::from_f64(self.cfg.max_total_exposure).unwrap_or(Decimal::ZERO);
        if total_open_cost >= total_limit {
            return Err(EngineError::RiskLimit(format!(
                "total exposure ${total_open_cost:.2} ≥ ${total_limit:.2}"
            )));
        }

        let asset_limit = balance * Decimal::from_f64(self.cfg.max_asset_exposure).unwrap_or(Decimal::ZERO);
        if asset_open_cost >= asset_limit {
            return Err(EngineError::RiskLimit(format!(
                "asset exposure ${asset_open_cost:.2} ≥ ${asset_limit:.2}"
            )));
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn settings() -> RiskSettings {
        RiskSettings {
            emergency_drawdown: 0.30,
            daily_pause_drawdown: 0.10,
            weekly_reduce_drawdown: 0.20,
            base_fraction: 0.05,
            max_fraction: 0.15,
            max_stake_usd: dec!(500),
            max_total_exposure: 0.50,
            max_asset_exposure: 0.20,
            max_open_bets: 5,
        }
    }

    fn manager(balance: Decimal) -> RiskManager {
        RiskManager::new(settings(), balance, Utc::now())
    }

    #[test]
    fn test_gate_allows_at_peak() {
        let mut rm = manager(dec!(10000));
        assert_eq!(rm.gate(dec!(10000)), EntryGate::Allowed { size_scale: 1.0 });
    }

    #[test]
    fn test_emergency_at_30pct_and_latches() {
        let mut rm = manager(dec!(10000));
        assert_eq!(rm.gate(dec!(7000)), EntryGate::Emergency);
        assert!(rm.is_emergency());

        // Recovery alone does not unlatch.
        assert_eq!(rm.gate(dec!(9500)), EntryGate::Emergency);

        rm.clear_emergency();
        assert_eq!(rm.gate(dec!(9500)), EntryGate::Allowed { size_scale: 1.0 });
    }

    #[test]
    fn test_daily_drawdown_pauses() {
        let mut rm = manager(dec!(10000));
        // 12% down on the day, but only 12% off peak (< 30%).
        match rm.gate(dec!(8800)) {
            EntryGate::Paused { reason } => assert!(reason.contains("daily")),
            other => panic!("expected pause, got {other:?}"),
        }
    }

    #[test]
    fn test_weekly_drawdown_halves_sizing() {
        let cfg = settings();
        // A fixed Tuesday keeps +1 day inside the same ISO week.
        let now = "2026-03-03T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let mut rm = RiskManager::new(cfg, dec!(10000), now);

        // Next day: the daily window rolls to the lower balance, the
        // weekly window keeps the original reference.
        rm.observe(dec!(7900), now + Duration::days(1));
        // 21% off the week open, 1.25% off today's open — under the
        // emergency threshold at 21% off peak.
        match rm.gate(dec!(7800)) {
            EntryGate::Allowed { size_scale } => assert_eq!(size_scale, 0.5),
            other => panic!("expected reduced sizing, got {other:?}"),
        }
    }

    #[test]
    fn test_observe_rolls_windows_and_peak() {
        let now = Utc::now();
        let mut rm = RiskManager::new(settings(), dec!(10000), now);

        rm.observe(dec!(11000), now);
        assert_eq!(rm.peak_balance, dec!(11000));

        // Eight days later both windows roll.
        rm.observe(dec!(10500), now + Duration::days(8));
        assert_eq!(rm.day_open, dec!(10500));
        assert_eq!(rm.week_open, dec!(10500));
    }

    #[test]
    fn test_stake_baseline() {
        let rm = manager(dec!(10000));
        // No volatility, middling confidence: 5% of balance.
        let stake = rm.stake(dec!(10000), 0.0, 0.5, 1.0);
        assert_eq!(stake, dec!(500));
    }

    #[test]
    fn test_stake_confidence_scales_up() {
        let rm = manager(dec!(1000));
        let base = rm.stake(dec!(1000), 0.0, 0.60, 1.0);
        let high = rm.stake(dec!(1000), 0.0, 1.0, 1.0);
        assert!(high > base);
        // Full confidence reaches the 1.5× factor: 5% × 1.5 = 7.5%.
        assert_eq!(high, dec!(75));
    }

    #[test]
    fn test_stake_volatility_scales_down() {
        let rm = manager(dec!(1000));
        let calm = rm.stake(dec!(1000), 0.0, 0.5, 1.0);
        let wild = rm.stake(dec!(1000), 2.0, 0.5, 1.0);
        assert!(wild < calm);
    }

    #[test]
    fn test_stake_absolute_cap() {
        let rm = manager(dec!(1000000));
        // 5% of $1M would be $50k; the $500 cap wins.
        let stake = rm.stake(dec!(1000000), 0.0, 0.5, 1.0);
        assert_eq!(stake, dec!(500));

        // Multiplier scales the cap.
        let scaled = rm.stake(dec!(1000000), 0.0, 0.5, 1.5);
        assert_eq!(scaled, dec!(750));
    }

    #[test]
    fn test_stake_zero_balance() {
        let rm = manager(dec!(0));
        assert_eq!(rm.stake(dec!(0), 0.0, 0.9, 1.0), Decimal::ZERO);
    }

    #[test]
    fn test_exposure_total_cap() {
        let rm = manager(dec!(1000));
        assert!(rm.check_exposure(dec!(1000), dec!(499), dec!(0), 0).is_ok());
        let err = rm.check_exposure(dec!(1000), dec!(500), dec!(0), 0).unwrap_err();
        assert!(matches!(err, EngineError::RiskLimit(_)));
    }

    #[test]
    fn test_exposure_asset_cap() {
        let rm = manager(dec!(1000));
        assert!(rm.check_exposure(dec!(1000), dec!(250), dec!(199), 2).is_ok());
        assert!(rm.check_exposure(dec!(1000), dec!(250), dec!(200), 2).is_err());
    }

    #[test]
    fn test_exposure_open_bet_ceiling() {
        let rm = manager(dec!(1000));
        assert!(rm.check_exposure(dec!(1000), dec!(0), dec!(0), 4).is_ok());
        assert!(rm.check_exposure(dec!(1000), dec!(0), dec!(0), 5).is_err());
    }
}
