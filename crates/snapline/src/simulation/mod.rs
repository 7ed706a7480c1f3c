mod clock;
mod input;
mod tick;

pub use clock::SimulationClock;
pub use input::{Buttons, InputQueue, SimulationInput, TickInputs};
pub use tick::{HitContext, Role, Simulation, Simulator, TickContext};
