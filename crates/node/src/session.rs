//! Session plan executor.

use pumplink_clock::ClockSync;
use pumplink_core::{
    DeliveryOutcome, DeliveryReport, Preflight, SessionContext, SessionPlan, SessionReport,
};
use pumplink_dispatch::PumpSession;
use pumplink_types::{DoseId, DoseKind, LinkError, PumpFault};
use tracing::{trace, warn};

/// Run one plan inside an open session.
///
/// Delivery plans always produce a report; their faults are carried in the
/// [`DeliveryOutcome`]. For every other plan a pump fault fails the session.
pub fn execute_plan(
    plan: &SessionPlan,
    pump: &mut dyn PumpSession,
    ctx: SessionContext,
) -> Result<SessionReport, LinkError> {
    match plan {
        SessionPlan::ReadStatus => {
            let snapshot = pump.read_status().map_err(into_link_error)?;
            let history = match ctx.history_since {
                Some(since) => pump.read_history(since).unwrap_or_else(|fault| {
                    // The snapshot is still good without history.
                    warn!(%fault, "Pump history read failed");
                    Vec::new()
                }),
                None => Vec::new(),
            };
            Ok(SessionReport::Status { snapshot, history })
        }
        SessionPlan::Deliver {
            dose,
            kind,
            preflight,
        } => Ok(SessionReport::Delivery(deliver(
            *dose, *kind, *preflight, pump, ctx,
        ))),
        SessionPlan::SetClock => pump
            .set_clock(ctx.local_now)
            .map(|pump_clock| SessionReport::ClockSet { pump_clock })
            .map_err(into_link_error),
        SessionPlan::Tune => pump
            .tune()
            .map(|frequency_mhz| SessionReport::Tuned { frequency_mhz })
            .map_err(into_link_error),
    }
}

fn deliver(
    dose: DoseId,
    kind: DoseKind,
    preflight: Preflight,
    pump: &mut dyn PumpSession,
    ctx: SessionContext,
) -> DeliveryReport {
    let mut report = DeliveryReport {
        dose,
        preflight: None,
        checked_at: ctx.local_now,
        commands_sent: 0,
        outcome: DeliveryOutcome::Acknowledged,
    };

    if let Preflight::ReadFirst { max_clock_skew } = preflight {
        match pump.read_status() {
            Ok(snapshot) => {
                let pump_clock = snapshot.clock;
                report.preflight = Some(snapshot);
                if !ClockSync::is_trustworthy(pump_clock, ctx.local_now, max_clock_skew) {
                    report.outcome = DeliveryOutcome::ClockRejected { pump_clock };
                    return report;
                }
            }
            Err(fault) => {
                report.outcome = DeliveryOutcome::PreflightFailed(fault);
                return report;
            }
        }
    }

    trace!(dose = %dose, %kind, "Sending delivery command");
    report.commands_sent += 1;
    let sent = match kind {
        DoseKind::Bolus { units } => pump.deliver_bolus(units),
        DoseKind::TempBasal {
            rate_per_hour,
            duration,
        } => pump.set_temp_basal(rate_per_hour, duration),
    };
    report.outcome = match sent {
        Ok(()) => DeliveryOutcome::Acknowledged,
        Err(fault) => DeliveryOutcome::Failed(fault),
    };
    report
}

fn into_link_error(fault: PumpFault) -> LinkError {
    match fault {
        PumpFault::Link(e) => e,
        other => LinkError::Protocol(other.to_string()),
    }
}
