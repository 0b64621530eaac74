//! Runs a plan against a transport

use tokio::time::sleep;
use tracing::trace;

use crate::hid::ReportCodec;
use crate::planner::{Plan, Step};
use crate::transport::{Transport, TransportResult};

/// Send every report of `plan`, sleeping between them as planned
///
/// Returns the number of reports sent. Stops at the first send error.
pub async fn execute(
    plan: Plan,
    codec: &ReportCodec,
    transport: &mut dyn Transport,
) -> TransportResult<usize> {
    let mut sent = 0;

    for step in plan {
        match step {
            Step::Emit(report) => {
                let frame = codec.encode(&report);
                trace!("-> {}", frame);
                transport.send(&frame).await?;
                sent += 1;
            }
            Step::Wait(delay) => sleep(delay).await,
        }
    }

    Ok(sent)
}
