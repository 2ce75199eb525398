//! Position reconciliation.
//!
//! Compares the brokerage account (what is actually open) against the
//! position log's latest rows (what the system believes) and classifies
//! every difference. A position the log says is open but the brokerage does
//! not have is the critical case: the system would keep making decisions on
//! exposure that no longer exists.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use possync_core::config::ReconciliationConfig;
use possync_core::traits::Alerter;
use possync_core::types::{BrokerPosition, Conid};
use possync_data::PositionRecord;

use crate::session::BrokerageSession;
use crate::writer::PositionLog;

/// How a broker position and its logged counterpart disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscrepancyKind {
    /// Open at the brokerage, absent from the log.
    MissingFromLog,
    /// Recorded open in the log, absent from the brokerage.
    NakedPosition,
    /// Present on both sides with quantities apart by more than the
    /// tolerance.
    PositionMismatch,
}

impl DiscrepancyKind {
    /// Canonical tag used in summaries and alerts.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingFromLog => "MISSING_FROM_LOG",
            Self::NakedPosition => "NAKED_POSITION",
            Self::PositionMismatch => "POSITION_MISMATCH",
        }
    }

    /// Only a naked position is critical: the log claims exposure the
    /// account does not have.
    #[must_use]
    pub fn is_critical(self) -> bool {
        matches!(self, Self::NakedPosition)
    }
}

/// One classified difference between the account and the log.
#[derive(Debug, Clone, Serialize)]
pub struct Discrepancy {
    pub kind: DiscrepancyKind,
    pub conid: Conid,
    pub symbol: String,
    pub broker_quantity: Option<f64>,
    pub persisted_quantity: Option<f64>,
    pub detail: String,
}

/// Classifies every conid in the union of both sides.
///
/// A persisted quantity of zero means the log already recorded the close;
/// the brokerage not listing the contract then matches. Quantity comparison
/// is strict: a difference of exactly `tolerance` is still a match.
fn classify(
    broker: &[BrokerPosition],
    persisted: &[PositionRecord],
    tolerance: f64,
) -> Vec<Discrepancy> {
    let broker_by_conid: HashMap<Conid, &BrokerPosition> =
        broker.iter().map(|p| (p.conid, p)).collect();
    let persisted_by_conid: HashMap<Conid, &PositionRecord> =
        persisted.iter().map(|r| (r.conid, r)).collect();

    let conids: BTreeSet<Conid> = broker_by_conid
        .keys()
        .chain(persisted_by_conid.keys())
        .copied()
        .collect();

    let mut discrepancies = Vec::new();
    for conid in conids {
        match (broker_by_conid.get(&conid), persisted_by_conid.get(&conid)) {
            (Some(b), None) => discrepancies.push(Discrepancy {
                kind: DiscrepancyKind::MissingFromLog,
                conid,
                symbol: b.symbol.clone(),
                broker_quantity: Some(b.quantity),
                persisted_quantity: None,
                detail: format!("open at brokerage ({}) but never recorded", b.quantity),
            }),
            (None, Some(p)) => {
                if p.quantity != 0.0 {
                    discrepancies.push(Discrepancy {
                        kind: DiscrepancyKind::NakedPosition,
                        conid,
                        symbol: p.symbol.clone(),
                        broker_quantity: None,
                        persisted_quantity: Some(p.quantity),
                        detail: format!(
                            "recorded open ({}) but not held at the brokerage",
                            p.quantity
                        ),
                    });
                }
            }
            (Some(b), Some(p)) => {
                if (b.quantity - p.quantity).abs() > tolerance {
                    discrepancies.push(Discrepancy {
                        kind: DiscrepancyKind::PositionMismatch,
                        conid,
                        symbol: b.symbol.clone(),
                        broker_quantity: Some(b.quantity),
                        persisted_quantity: Some(p.quantity),
                        detail: format!(
                            "brokerage holds {} but log records {}",
                            b.quantity, p.quantity
                        ),
                    });
                }
            }
            (None, None) => unreachable!("conid came from one of the two maps"),
        }
    }
    discrepancies
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub broker_count: usize,
    pub persisted_count: usize,
    pub discrepancies: Vec<Discrepancy>,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl ReconciliationReport {
    /// True when no discrepancy of any kind was found.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.discrepancies.is_empty()
    }

    /// True when at least one critical discrepancy was found.
    #[must_use]
    pub fn has_critical_issues(&self) -> bool {
        self.discrepancies.iter().any(|d| d.kind.is_critical())
    }

    /// Multi-line human-readable summary.
    #[must_use]
    pub fn format_summary(&self) -> String {
        let critical = self
            .discrepancies
            .iter()
            .filter(|d| d.kind.is_critical())
            .count();
        let mut summary = format!(
            "reconciliation in {} ms: {} at brokerage, {} in log, {} discrepancies ({} critical)",
            self.duration_ms,
            self.broker_count,
            self.persisted_count,
            self.discrepancies.len(),
            critical
        );
        for d in &self.discrepancies {
            summary.push_str(&format!(
                "\n  [{}] conid {} {}: {}",
                d.kind.as_str(),
                d.conid,
                d.symbol,
                d.detail
            ));
        }
        summary
    }
}

/// Compares the account snapshot with the log's latest rows.
pub struct Reconciler {
    session: Arc<BrokerageSession>,
    log: PositionLog,
    quantity_tolerance: f64,
}

impl Reconciler {
    /// Creates a reconciler with the given quantity tolerance.
    #[must_use]
    pub fn new(session: Arc<BrokerageSession>, log: PositionLog, quantity_tolerance: f64) -> Self {
        Self {
            session,
            log,
            quantity_tolerance,
        }
    }

    /// Runs one reconciliation pass.
    ///
    /// Flushes the log first so buffered observations are part of the
    /// comparison rather than spurious discrepancies.
    ///
    /// # Errors
    /// Returns an error if the flush, the snapshot, or the log read fails.
    pub async fn reconcile(&self) -> Result<ReconciliationReport> {
        let started = std::time::Instant::now();

        self.log.flush().await?;
        self.session.ensure_connected().await?;
        let broker = self.session.fetch_open_positions().await?;
        let persisted = self.log.read_latest().await?;

        let discrepancies = classify(&broker, &persisted, self.quantity_tolerance);
        let report = ReconciliationReport {
            broker_count: broker.len(),
            persisted_count: persisted.len(),
            discrepancies,
            duration_ms: started.elapsed().as_millis() as u64,
            completed_at: Utc::now(),
        };

        if report.has_critical_issues() {
            warn!(
                discrepancies = report.discrepancies.len(),
                "reconciliation found critical discrepancies"
            );
        } else {
            info!(
                discrepancies = report.discrepancies.len(),
                broker = report.broker_count,
                persisted = report.persisted_count,
                "reconciliation completed"
            );
        }
        Ok(report)
    }
}

/// Periodic reconciliation with critical alert delivery.
pub struct ReconciliationService {
    reconciler: Reconciler,
    alerter: Arc<dyn Alerter>,
    config: ReconciliationConfig,
}

impl ReconciliationService {
    #[must_use]
    pub fn new(reconciler: Reconciler, alerter: Arc<dyn Alerter>, config: ReconciliationConfig) -> Self {
        Self {
            reconciler,
            alerter,
            config,
        }
    }

    /// Runs passes on the configured interval until shutdown.
    ///
    /// Returns immediately when reconciliation is disabled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("reconciliation disabled by configuration");
            return;
        }

        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(self.config.interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = self.config.interval_secs,
            "reconciliation service started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "reconciliation pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("reconciliation service stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One pass plus alert delivery for critical findings.
    ///
    /// # Errors
    /// Returns an error if the reconciliation itself fails. An alert
    /// delivery failure is logged, not propagated.
    pub async fn run_once(&self) -> Result<ReconciliationReport> {
        let report = self.reconciler.reconcile().await?;
        if report.has_critical_issues() {
            let message = report.format_summary();
            if let Err(e) = self.alerter.send_critical(&message).await {
                error!(error = %e, "failed to deliver critical reconciliation alert");
            }
        }
        Ok(report)
    }
}

/// Alerter that writes critical findings to the error log.
pub struct LogAlerter;

#[async_trait::async_trait]
impl Alerter for LogAlerter {
    async fn send_critical(&self, message: &str) -> Result<()> {
        error!(alert = %message, "critical reconciliation alert");
        Ok(())
    }
}
