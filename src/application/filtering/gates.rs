//! The ordered nine-gate filter chain.
//!
//! Gates run cheapest-first and the first rejection ends the evaluation.
//! Later gates reuse what earlier gates computed through `GateScratch`, so
//! the expensive leverage math runs at most once per timepoint. Every gate
//! reads market data exclusively through the as-of `DataView`.

use super::prepared_data::DataView;
use crate::application::analysis::btc_correlation;
use crate::application::analysis::market_context::{self, MarketContext, Trend};
use crate::application::decision::leverage::{self, LeverageInputs, LeveragePlan};
use crate::application::ml::RangePrediction;
use crate::config::ResolvedThresholds;
use crate::config::defaults::{BtcDefaults, StrategyRuleDefaults, VolatilityDefaults};
use crate::domain::levels::NearbyLevels;
use crate::domain::outcome::{FilterStage, GateDecision};
use crate::domain::strategy::{BaseKind, StrategyConfig};
use chrono::Duration;
use serde_json::json;
use std::collections::HashSet;

/// Everything a gate may read at one evaluation timepoint.
pub struct GateContext<'a> {
    pub view: &'a DataView<'a>,
    pub thresholds: &'a ResolvedThresholds,
    pub strategy: &'a StrategyConfig,
    pub rules: &'a StrategyRuleDefaults,
    pub btc: &'a BtcDefaults,
    pub vol_defaults: &'a VolatilityDefaults,
}

/// Artifacts accumulated while the chain runs, reused by the decision path
/// when every gate passes.
#[derive(Default)]
pub struct GateScratch {
    pub nearby: Option<NearbyLevels>,
    pub prediction: Option<RangePrediction>,
    pub volatility: Option<f64>,
    pub plan: Option<LeveragePlan>,
    pub market_context: Option<MarketContext>,
    pub btc_correlation: Option<f64>,
}

pub enum ChainVerdict {
    Passed,
    Rejected {
        stage: FilterStage,
        reason: String,
        metrics: serde_json::Value,
    },
}

/// Runs the nine gates in order, skipping any the caller disabled.
pub fn run_chain(
    ctx: &GateContext<'_>,
    disabled: &HashSet<FilterStage>,
    scratch: &mut GateScratch,
) -> ChainVerdict {
    for stage in FilterStage::all() {
        if disabled.contains(&stage) {
            continue;
        }
        let decision = match stage {
            FilterStage::DataQuality => gate_data_quality(ctx),
            FilterStage::MarketConditions => gate_market_conditions(ctx),
            FilterStage::SupportResistanceExistence => gate_sr_existence(ctx, scratch),
            FilterStage::DistanceStrength => gate_distance_strength(ctx, scratch),
            FilterStage::MlConfidence => gate_ml_confidence(ctx, scratch),
            FilterStage::Volatility => gate_volatility(ctx, scratch),
            FilterStage::LeverageFeasibility => gate_leverage_feasibility(ctx, scratch),
            FilterStage::RiskReward => gate_risk_reward(ctx, scratch),
            FilterStage::StrategySpecific => gate_strategy_specific(ctx, scratch),
        };
        if let GateDecision::Reject { reason, metrics } = decision {
            return ChainVerdict::Rejected {
                stage,
                reason,
                metrics,
            };
        }
    }
    ChainVerdict::Passed
}

// --- Gate 1: data quality (light) ----------------------------------------

fn gate_data_quality(ctx: &GateContext<'_>) -> GateDecision {
    let view = ctx.view;
    let current = view.current();

    if !current.is_well_formed() {
        return GateDecision::reject("malformed candle at evaluation timepoint");
    }
    if view.len() >= 2 {
        let prev = &view.candles()[view.len() - 2];
        if prev.close > 0.0 {
            let jump = ((current.open - prev.close) / prev.close).abs();
            if jump > ctx.thresholds.anomaly_return_pct {
                return GateDecision::reject_with(
                    "anomalous price spike",
                    json!({ "jump_pct": jump * 100.0 }),
                );
            }
        }
    }
    if view.has_local_gap(5) {
        return GateDecision::reject("missing candle in local neighborhood");
    }
    GateDecision::Pass
}

// --- Gate 2: market conditions (light) -----------------------------------

fn gate_market_conditions(ctx: &GateContext<'_>) -> GateDecision {
    let view = ctx.view;
    let candles = view.candles();
    let window = &candles[candles.len().saturating_sub(10)..];
    let avg_volume = window.iter().map(|c| c.volume).sum::<f64>() / window.len() as f64;

    if avg_volume < ctx.thresholds.min_volume {
        return GateDecision::reject_with(
            "volume below threshold",
            json!({ "avg_volume": avg_volume, "min_volume": ctx.thresholds.min_volume }),
        );
    }
    let spread = view.current().range_pct();
    if spread > ctx.thresholds.max_spread_pct {
        return GateDecision::reject_with(
            "spread above threshold",
            json!({ "spread_pct": spread * 100.0 }),
        );
    }
    if view.current().turnover() < ctx.thresholds.min_turnover {
        return GateDecision::reject_with(
            "liquidity score too low",
            json!({ "turnover": view.current().turnover() }),
        );
    }
    GateDecision::Pass
}

// --- Gate 3: support/resistance existence (light) ------------------------

fn gate_sr_existence(ctx: &GateContext<'_>, scratch: &mut GateScratch) -> GateDecision {
    let nearby = ctx.view.nearby_levels(
        ctx.thresholds.min_support_strength,
        ctx.thresholds.min_resistance_strength,
    );
    let decision = if nearby.nearest_support().is_none() {
        GateDecision::reject("no qualifying support below price")
    } else if nearby.nearest_resistance().is_none() {
        GateDecision::reject("no qualifying resistance above price")
    } else {
        GateDecision::Pass
    };
    scratch.nearby = Some(nearby);
    decision
}

// --- Gate 4: distance & strength (medium) --------------------------------

fn gate_distance_strength(ctx: &GateContext<'_>, scratch: &mut GateScratch) -> GateDecision {
    // Gate 3 normally fills this; compute here when it was disabled.
    if scratch.nearby.is_none() {
        scratch.nearby = Some(ctx.view.nearby_levels(
            ctx.thresholds.min_support_strength,
            ctx.thresholds.min_resistance_strength,
        ));
    }
    let Some(nearby) = scratch.nearby.as_ref() else {
        return GateDecision::reject("levels not computed");
    };
    let price = ctx.view.reference_price();
    let bounds = (
        ctx.thresholds.min_level_distance_pct,
        ctx.thresholds.max_level_distance_pct,
    );

    for (label, level) in [
        ("support", nearby.nearest_support()),
        ("resistance", nearby.nearest_resistance()),
    ] {
        let Some(level) = level else {
            return GateDecision::reject(format!("no {} level", label));
        };
        let distance = level.abs_distance_pct(price);
        if distance < bounds.0 {
            return GateDecision::reject_with(
                format!("price too close to nearest {}", label),
                json!({ "distance_pct": distance * 100.0 }),
            );
        }
        if distance > bounds.1 {
            return GateDecision::reject_with(
                format!("price too far from nearest {}", label),
                json!({ "distance_pct": distance * 100.0 }),
            );
        }
    }
    GateDecision::Pass
}

// --- Gate 5: ML confidence (medium) --------------------------------------

fn gate_ml_confidence(ctx: &GateContext<'_>, scratch: &mut GateScratch) -> GateDecision {
    if !ctx.strategy.base_kind.uses_ml() {
        // Traditional family: the chain carries a geometry-derived signal
        // instead of a model score.
        let proxy = traditional_prediction(ctx, scratch);
        scratch.prediction = Some(proxy);
        return GateDecision::Pass;
    }

    let Some(predictor) = ctx.view.predictor() else {
        return GateDecision::reject("no trained model for instrument/timeframe");
    };
    let prediction =
        match predictor.predict(ctx.view.candles(), ctx.view.current_index()) {
            Ok(prediction) => prediction,
            Err(reason) => {
                return GateDecision::reject(format!("ML inputs unavailable: {}", reason));
            }
        };

    let strength = prediction.signal_strength();
    scratch.prediction = Some(prediction);
    if strength < ctx.thresholds.min_confidence {
        return GateDecision::reject_with(
            "predicted confidence below strategy threshold",
            json!({ "signal_strength": strength, "min_confidence": ctx.thresholds.min_confidence }),
        );
    }
    GateDecision::Pass
}

/// Non-ML signal proxy: trend direction plus level quality. Distinct from a
/// missing-data fallback; this is how the traditional family scores setups.
fn traditional_prediction(ctx: &GateContext<'_>, scratch: &GateScratch) -> RangePrediction {
    let trend = market_context::assess(
        ctx.view.candles(),
        ctx.view.volatility(),
        ctx.thresholds.anomaly_return_pct,
    )
    .map(|c| c.trend)
    .unwrap_or(Trend::Sideways);

    let support_strength = scratch
        .nearby
        .as_ref()
        .and_then(|n| n.nearest_support())
        .map(|s| s.strength)
        .unwrap_or(0.0);

    let breakout = match trend {
        Trend::Bullish => 0.55,
        Trend::Sideways => 0.40,
        Trend::Bearish => 0.25,
    };
    RangePrediction {
        breakout_probability: breakout,
        bounce_probability: (0.3 + 0.5 * support_strength).min(0.9),
    }
}

// --- Gate 6: volatility (medium) ------------------------------------------

fn gate_volatility(ctx: &GateContext<'_>, scratch: &mut GateScratch) -> GateDecision {
    let Some(vol) = ctx.view.volatility() else {
        return GateDecision::reject("volatility window not filled");
    };
    scratch.volatility = Some(vol);

    if vol < ctx.thresholds.vol_min {
        return GateDecision::reject_with(
            "volatility below band",
            json!({ "volatility": vol, "vol_min": ctx.thresholds.vol_min }),
        );
    }
    if vol > ctx.thresholds.vol_max {
        return GateDecision::reject_with(
            "volatility above band",
            json!({ "volatility": vol, "vol_max": ctx.thresholds.vol_max }),
        );
    }
    if vol > 0.85 * ctx.thresholds.vol_max
        && let Some(trend) = ctx.view.volatility_trend()
        && trend > ctx.vol_defaults.rapid_increase_ratio
    {
        return GateDecision::reject_with(
            "volatility rapidly increasing near band maximum",
            json!({ "volatility": vol, "trend_ratio": trend }),
        );
    }
    GateDecision::Pass
}

// --- Gate 7: leverage feasibility (heavy) ---------------------------------

fn gate_leverage_feasibility(ctx: &GateContext<'_>, scratch: &mut GateScratch) -> GateDecision {
    let (Some(nearby), Some(prediction), Some(volatility)) = (
        scratch.nearby.as_ref(),
        scratch.prediction.as_ref(),
        scratch.volatility,
    ) else {
        return GateDecision::reject("prerequisite gates did not run");
    };

    let plan = match leverage::compute_plan(
        &LeverageInputs {
            reference_price: ctx.view.reference_price(),
            nearby,
            prediction,
            volatility,
            atr_pct: ctx.view.atr_pct(),
        },
        ctx.strategy.base_kind.stop_take_calculator(),
        ctx.thresholds,
    ) {
        Ok(plan) => plan,
        Err(e) => return GateDecision::reject(format!("leverage computation failed: {}", e)),
    };

    let decision = if plan.leverage < ctx.thresholds.min_leverage {
        GateDecision::reject_with(
            "safe leverage below minimum",
            json!({ "leverage": plan.leverage, "min_leverage": ctx.thresholds.min_leverage }),
        )
    } else if plan.risk_level > ctx.thresholds.max_risk_level {
        GateDecision::reject_with(
            "risk level above strategy maximum",
            json!({ "risk_level": plan.risk_level }),
        )
    } else {
        GateDecision::Pass
    };
    scratch.plan = Some(plan);
    decision
}

// --- Gate 8: risk/reward (heavy) ------------------------------------------

fn gate_risk_reward(ctx: &GateContext<'_>, scratch: &mut GateScratch) -> GateDecision {
    let Some(plan) = scratch.plan.as_ref() else {
        return GateDecision::reject("leverage plan not computed");
    };

    if plan.risk_reward < ctx.thresholds.min_risk_reward {
        return GateDecision::reject_with(
            "risk/reward below minimum",
            json!({ "risk_reward": plan.risk_reward, "min": ctx.thresholds.min_risk_reward }),
        );
    }
    if plan.max_equity_loss_pct > ctx.thresholds.max_loss_pct {
        return GateDecision::reject_with(
            "max loss above strategy cap",
            json!({ "max_loss_pct": plan.max_equity_loss_pct * 100.0 }),
        );
    }
    if plan.profit_probability < ctx.thresholds.min_profit_probability {
        return GateDecision::reject_with(
            "profit probability below strategy minimum",
            json!({ "profit_probability": plan.profit_probability }),
        );
    }
    GateDecision::Pass
}

// --- Gate 9: strategy-specific (heavy) ------------------------------------

fn gate_strategy_specific(ctx: &GateContext<'_>, scratch: &mut GateScratch) -> GateDecision {
    let Some(plan) = scratch.plan.as_ref() else {
        return GateDecision::reject("leverage plan not computed");
    };
    let signal = scratch
        .prediction
        .as_ref()
        .map(|p| p.signal_strength())
        .unwrap_or(0.0);

    match ctx.strategy.base_kind {
        BaseKind::ConservativeMl => {
            let min_confidence = ctx.rules.min_confidence.unwrap_or(0.8);
            if signal < min_confidence {
                return GateDecision::reject_with(
                    "conservative rule: confidence too low",
                    json!({ "signal_strength": signal, "required": min_confidence }),
                );
            }
            let correlation = match btc_correlation_at(ctx) {
                Some(corr) => corr,
                None => {
                    return GateDecision::reject(
                        "conservative rule: BTC correlation unavailable",
                    );
                }
            };
            scratch.btc_correlation = Some(correlation);
            let cap = ctx.rules.max_abs_btc_correlation.unwrap_or(0.7);
            if correlation.abs() > cap {
                return GateDecision::reject_with(
                    "conservative rule: BTC correlation too high",
                    json!({ "correlation": correlation, "cap": cap }),
                );
            }
        }
        BaseKind::AggressiveMl => {
            let min_vol = ctx.rules.min_volatility.unwrap_or(0.03);
            let vol = scratch.volatility.unwrap_or(0.0);
            if vol < min_vol {
                return GateDecision::reject_with(
                    "aggressive rule: volatility too low",
                    json!({ "volatility": vol, "required": min_vol }),
                );
            }
            let min_signal = ctx.rules.min_signal_strength.unwrap_or(0.6);
            if signal < min_signal {
                return GateDecision::reject_with(
                    "aggressive rule: signal too weak",
                    json!({ "signal_strength": signal, "required": min_signal }),
                );
            }
        }
        BaseKind::AggressiveTraditional => {
            let context = match market_context::assess(
                ctx.view.candles(),
                scratch.volatility,
                ctx.thresholds.anomaly_return_pct,
            ) {
                Ok(context) => context,
                Err(missing) => {
                    return GateDecision::reject(format!(
                        "traditional rule: market context unresolvable ({})",
                        missing
                    ));
                }
            };
            scratch.market_context = Some(context);
            if context.trend == Trend::Sideways {
                return GateDecision::reject("traditional rule: no directional trend");
            }
            let min_touches = ctx.rules.min_level_touches.unwrap_or(3);
            let touches = scratch
                .nearby
                .as_ref()
                .and_then(|n| n.nearest_support())
                .map(|s| s.touches)
                .unwrap_or(0);
            if touches < min_touches {
                return GateDecision::reject_with(
                    "traditional rule: support not established",
                    json!({ "touches": touches, "required": min_touches }),
                );
            }
        }
        BaseKind::FullMl => {
            let combined =
                0.5 * signal + 0.3 * plan.confidence + 0.2 * (1.0 - plan.risk_level);
            let min_combined = ctx.rules.min_combined_score.unwrap_or(0.65);
            if combined < min_combined {
                return GateDecision::reject_with(
                    "full-ml rule: combined score too low",
                    json!({ "combined_score": combined, "required": min_combined }),
                );
            }
        }
        BaseKind::Balanced => {
            let min_confidence = ctx.rules.min_confidence.unwrap_or(0.6);
            if plan.confidence < min_confidence {
                return GateDecision::reject_with(
                    "balanced rule: confidence too low",
                    json!({ "confidence": plan.confidence, "required": min_confidence }),
                );
            }
            let min_rr = ctx.rules.min_risk_reward.unwrap_or(1.5);
            if plan.risk_reward < min_rr {
                return GateDecision::reject_with(
                    "balanced rule: risk/reward too low",
                    json!({ "risk_reward": plan.risk_reward, "required": min_rr }),
                );
            }
        }
    }
    GateDecision::Pass
}

/// Trailing 30-day BTC correlation at the view's timepoint, `None` when the
/// aligned overlap is too thin to trust. Shared with decision step 4.
pub(crate) fn btc_correlation_at(ctx: &GateContext<'_>) -> Option<f64> {
    let lookback = Duration::days(30);
    let cutoff = ctx.view.at() - lookback;
    let candles = ctx.view.candles();
    let start = candles.partition_point(|c| c.timestamp < cutoff);
    btc_correlation::assess(
        &candles[start..],
        ctx.view.btc_window(lookback),
        ctx.btc.min_overlap_points,
    )
    .map(|a| a.correlation)
}
