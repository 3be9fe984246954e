//! The process-wide device handle
//!
//! Bus, GPIO lines, operator console and the two external solvers are
//! acquired once at startup and passed explicitly to every operation.

use crate::config::Config;
use crate::error::Result;
use crate::flash::TargetVariant;
use crate::hw::{ConsoleOperator, LineDriver, Operator, PiLineDriver};
use crate::link::{CanBus, SocketCanBus};
use crate::solver::{CrcPreimageSolver, KeySolver, PreimageSolver, TwisterKeySolver};

pub struct Device {
    pub bus: Box<dyn CanBus>,
    pub lines: Box<dyn LineDriver>,
    pub operator: Box<dyn Operator>,
    pub key_solver: Box<dyn KeySolver>,
    pub crc_solver: Box<dyn PreimageSolver>,
    pub config: Config,
    pub variant: TargetVariant,
}

impl Device {
    /// Open the real bench hardware described by `config`.
    pub fn open(config: Config, variant: TargetVariant) -> Result<Self> {
        let bus = SocketCanBus::open(&config.can_interface)?;
        let lines = PiLineDriver::new(config.pwm_frequency)?;
        let key_solver =
            TwisterKeySolver::new(config.twister_path.clone(), config.seed_start.clone());
        let crc_solver = CrcPreimageSolver::new(config.crc_solver_path.clone());
        Ok(Self {
            bus: Box::new(bus),
            lines: Box::new(lines),
            operator: Box::new(ConsoleOperator),
            key_solver: Box::new(key_solver),
            crc_solver: Box::new(crc_solver),
            config,
            variant,
        })
    }
}
