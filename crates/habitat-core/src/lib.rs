//! Habitat Core -- a lumped-parameter mass, species and energy solver for
//! life-support flow networks.
//!
//! Matter lives in [`phase::Phase`]s grouped into volume-bounded
//! [`store::Store`]s. Phases exchange matter through [`branch::Branch`]es
//! between [`port::ExchangePort`]s, through phase-to-phase processors inside
//! a store, and change composition through manipulators. Every branch
//! carries exactly one [`solver::SolverHandler`] that decides its flow rate.
//!
//! # Tick Pipeline
//!
//! Each call to [`network::Network::step`] advances the network by one
//! adaptive time step:
//!
//! 1. **Resolve** -- Manual and Interval handlers, then Residual handlers,
//!    then every iterative multibranch group.
//! 2. **Process** -- flow-to-flow chains, phase-to-phase processors and
//!    manipulators turn rates into transfers.
//! 3. **Limit** -- transfers that would overdraw a phase are scaled down.
//! 4. **Integrate** -- every phase applies its net rates exactly once.
//! 5. **Exec** -- subsystem hooks run.
//! 6. **Propose** -- the clock picks the next step from phase and handler
//!    proposals.
//!
//! # Assembly
//!
//! Networks are wired by name on a [`builder::NetworkBuilder`] and frozen by
//! [`builder::NetworkBuilder::build`]; all wiring errors are
//! [`error::SetupError`]s raised before the first tick.
//!
//! ```rust,ignore
//! let mut b = NetworkBuilder::new(registry);
//! let tank = b.create_store("Tank", Capacity::Fixed(1.0))?;
//! let water = b.create_phase(tank, PhaseSpec::liquid("Water", masses, 293.15, 1e5))?;
//! b.create_port(water, "Out")?;
//! // ... sink store, phase and port ...
//! b.connect("Drain", "Tank.Out", "Sink.In")?;
//! b.set_handler("Drain", SolverHandler::manual(1.0))?;
//! let mut net = b.build()?;
//! net.advance_to(60.0);
//! ```
//!
//! # Key Types
//!
//! - [`network::Network`] -- the assembled network and its tick pipeline.
//! - [`phase::Phase`] -- a homogeneous mass with temperature and pressure.
//! - [`processor`] -- `FlowToFlow`, `PhaseToPhase` and `Manipulator` traits
//!   plus built-in processors.
//! - [`solver::SolverHandler`] -- Manual, Residual, Interval and
//!   IterativeMultibranch flow resolution.
//! - [`clock::Clock`] -- fixed-point simulated time and step selection.
//! - [`registry::Registry`] -- immutable substance table shared by all phases.
//! - [`report::TickReport`] -- per-tick degradations.

pub mod branch;
pub mod builder;
pub mod clock;
pub mod config;
pub mod error;
pub mod fixed;
pub mod id;
pub mod network;
pub mod observer;
pub mod phase;
pub mod port;
pub mod processor;
pub mod query;
pub mod registry;
pub mod report;
pub mod solver;
pub mod store;
pub mod subsystem;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
