use std::sync::Arc;
use tracing::{debug, info};

use crate::breakeven::BreakevenController;
use crate::error::Result;
use crate::gateway::ExchangeGateway;
use crate::ladder::LadderManager;
use crate::monitor::Monitor;

/// Milestone transitions replicated from the main account to the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Milestone {
    /// Main account reached RISK_FREE: entries cancelled, stop at breakeven.
    RiskFree,
}

/// Keeps a structurally parallel ladder on the mirror account. Structure
/// (price levels, percentage splits) is shared with the main monitor;
/// absolute quantities always derive from the mirror's own position size,
/// which is independent of the main account's.
pub struct MirrorSynchronizer {
    ladder: LadderManager,
    breakeven: BreakevenController,
}

impl MirrorSynchronizer {
    pub fn new(gateway: Arc<dyn ExchangeGateway>) -> Self {
        Self {
            ladder: LadderManager::new(gateway.clone()),
            breakeven: BreakevenController::new(gateway),
        }
    }

    /// Align the mirror's ladder structure with the main monitor's, then
    /// rebalance quantities from the mirror's own remaining size.
    pub async fn sync_ladder(&self, main: &Monitor, mirror: &mut Monitor) -> Result<()> {
        for main_tp in &main.take_profits {
            if let Some(tp) = mirror
                .take_profits
                .iter_mut()
                .find(|tp| tp.level == main_tp.level && !tp.filled)
            {
                tp.price = main_tp.price;
                tp.percentage = main_tp.percentage;
            }
        }

        // The stop price follows the main ladder only while both sides are
        // still at full risk; a breakeven stop is always derived from the
        // mirror's own entry price, never copied across accounts.
        if !main.sl_moved_to_breakeven && !mirror.sl_moved_to_breakeven {
            mirror.stop_loss.price = main.stop_loss.price;
        }

        debug!(
            "Mirror ladder sync for {}: {} levels, remaining {}",
            mirror.key(),
            mirror.unfilled_tp_levels().count(),
            mirror.remaining_size
        );

        self.ladder.rebalance(mirror).await
    }

    /// Apply a milestone transition from the main account on the mirror,
    /// recomputed against the mirror's own entry price and fee schedule.
    pub async fn propagate_milestone(
        &self,
        mirror: &mut Monitor,
        milestone: Milestone,
    ) -> Result<()> {
        match milestone {
            Milestone::RiskFree => {
                if mirror.sl_moved_to_breakeven {
                    return Ok(());
                }
                self.breakeven.arm(mirror);
                if let Some((cancelled, price)) = self.breakeven.ensure_risk_free(mirror).await? {
                    info!(
                        "🪞 Mirror {} followed main to risk-free: SL {} ({} entries cancelled)",
                        mirror.key(),
                        price,
                        cancelled
                    );
                }
                Ok(())
            }
        }
    }
}
