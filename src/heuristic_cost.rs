/*!

  The flipping layer above the SoI manager.

  Follows the GWSAT noise discipline: with probability `noise` the
  proposal is a uniformly random phase flip (descent not guaranteed, and
  the case-split controller is told a random flip happened), otherwise
  the configured search strategy picks the flip. A rejected proposal is
  undone by discarding it before the next round.

*/

use crate::config::Config;
use crate::constraints::PiecewiseLinear;
use crate::context::Context;
use crate::data_structures::RandomGenerator;
use crate::soi::SoiManager;

pub struct HeuristicCost {
  noise_parameter: f64,
  rand           : RandomGenerator,
}

impl HeuristicCost {
  pub fn new(config: &Config) -> Self {
    HeuristicCost {
      noise_parameter: config.noise_parameter,
      rand           : RandomGenerator::with_seed(config.seed.wrapping_add(2)),
    }
  }

  /// Initialization policy selection is delegated to the SoI manager.
  pub fn initialize(&self, soi: &mut SoiManager, constraints: &[Box<dyn PiecewiseLinear>],
                    ctx: &Context, oracle_assignment: Option<&[f64]>) {
    soi.initialize_phase_pattern(constraints, ctx, oracle_assignment);
  }

  /// Proposes the next flip. Returns whether descent is guaranteed;
  /// `false` means the flip was random and should be reported to the
  /// case-split controller.
  pub fn update_cost(&mut self, soi: &mut SoiManager,
                     constraints: &[Box<dyn PiecewiseLinear>]) -> bool {
    let use_noise = self.rand.next_f64() <= self.noise_parameter;
    if use_noise {
      soi.discard_proposal();
      soi.propose_randomly(constraints);
      false
    } else {
      soi.propose_update(constraints)
    }
  }

  /// Rolls back a rejected proposal.
  pub fn undo_last_update(&self, soi: &mut SoiManager) {
    soi.discard_proposal();
  }
}
