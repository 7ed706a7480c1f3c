/// Longest host frame the clock will account for, in seconds.
const MAX_FRAME: f32 = 0.25;

/// Turns host frame time into whole simulation ticks.
///
/// Time short of a full tick carries over to the next frame. A frame longer
/// than [`MAX_FRAME`] counts as exactly that long, so a host that hitches
/// runs a bounded burst of ticks rather than every tick it missed. The clock
/// only reports how many ticks are due: the server runs all of them, while
/// the client may run fewer when prediction has stalled on unconfirmed state.
#[derive(Debug, Clone)]
pub struct SimulationClock {
    dt: f32,
    carried: f32,
    running: bool,
}

impl SimulationClock {
    /// A stopped clock for `tick_rate` ticks per second.
    pub fn new(tick_rate: u32) -> Self {
        Self {
            dt: 1.0 / tick_rate.max(1) as f32,
            carried: 0.0,
            running: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Starts counting from a clean slate. No-op while already running.
    pub fn start(&mut self) {
        if !self.running {
            self.carried = 0.0;
            self.running = true;
        }
    }

    /// Stops and drops any partial tick.
    pub fn stop(&mut self) {
        self.running = false;
        self.carried = 0.0;
    }

    /// Feeds `delta` seconds of host time and returns how many ticks are now
    /// due. Always 0 while stopped.
    pub fn advance(&mut self, delta: f32) -> u32 {
        if !self.running {
            return 0;
        }
        self.carried += delta.clamp(0.0, MAX_FRAME);
        let due = (self.carried / self.dt).floor();
        self.carried -= due * self.dt;
        due as u32
    }
}
