//! # Unpacking Engine
//!
//! Runs the whole pipeline for one target:
//!
//! 1. inspect the file and select a [`ProtectorProfile`]
//! 2. launch it under a [`ProcessController`] and trace to the OEP
//! 3. capture the snapshot and terminate the process
//! 4. resolve imports and rebuild the image from the snapshot alone
//! 5. write the output file
//!
//! Steps 4 and 5 never touch the process; once the snapshot exists the live
//! session is gone.

use std::fmt;

use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::UnpackConfig;
use crate::controller::{create_controller, LaunchTarget, ProcessController};
use crate::error::Result;
use crate::imports::{self, ImportTable};
use crate::oep::{self, Oep, OepDetector, Transition};
use crate::pe::TargetFile;
use crate::profile::{self, probe, ProfileRequest, ProtectorProfile};
use crate::reconstruct::{self, ReconstructedImage};

/// Callback invoked at the OEP while the process is still alive.
pub type OepHook = Box<dyn FnMut(&Oep)>;

/// Everything a successful run produced
#[derive(Debug, Clone)]
pub struct UnpackReport
{
    /// Profile the run used.
    pub profile: ProtectorProfile,
    /// Confirmed entry point.
    pub oep: Oep,
    /// Detector transitions, in order.
    pub transitions: Vec<Transition>,
    /// Resolved import table.
    pub imports: ImportTable,
    /// Rebuilt image.
    pub image: ReconstructedImage,
}

impl UnpackReport
{
    /// Whether some result carries a caveat (generic profile or unrecoverable imports).
    #[must_use]
    pub fn has_warnings(&self) -> bool
    {
        self.profile.low_confidence || !self.image.unrecoverable.is_empty()
    }
}

/// Runs [`UnpackConfig`]s
pub struct Unpacker
{
    config: UnpackConfig,
    on_oep: Option<OepHook>,
}

impl fmt::Debug for Unpacker
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Unpacker")
            .field("config", &self.config)
            .field("on_oep", &self.on_oep.is_some())
            .finish()
    }
}

impl Unpacker
{
    /// Create an unpacker for a validated configuration.
    #[must_use]
    pub fn new(config: UnpackConfig) -> Self
    {
        Self { config, on_oep: None }
    }

    /// Hook called at the OEP when `pause_on_oep` is set.
    #[must_use]
    pub fn with_oep_hook(mut self, hook: impl FnMut(&Oep) + 'static) -> Self
    {
        self.on_oep = Some(Box::new(hook));
        self
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &UnpackConfig
    {
        &self.config
    }

    /// Run against the platform debugger and write the output file
    ///
    /// ## Errors
    ///
    /// Any run-level [`crate::UnpackError`]; see [`Unpacker::run_on`].
    pub fn run(&mut self) -> Result<UnpackReport>
    {
        let mut controller = create_controller()?;
        let clock = SystemClock::start();
        let report = self.run_with(controller.as_mut(), &clock)?;
        std::fs::write(&self.config.output, &report.image.bytes)?;
        info!("Wrote {} ({} bytes)", self.config.output.display(), report.image.bytes.len());
        Ok(report)
    }

    /// Inspect the configured file and run against `controller`.
    ///
    /// ## Errors
    ///
    /// [`crate::UnpackError::Io`] / [`crate::UnpackError::InvalidTarget`] for
    /// the file, then everything [`Unpacker::run_on`] returns.
    pub fn run_with(&mut self, controller: &mut dyn ProcessController, clock: &dyn Clock) -> Result<UnpackReport>
    {
        let target = TargetFile::inspect(&self.config.target)?;
        self.run_on(&target, controller, clock)
    }

    /// Run the pipeline for an already inspected file
    ///
    /// ## Errors
    ///
    /// - [`crate::UnpackError::UnsupportedProfile`] from profile selection
    /// - [`crate::UnpackError::Launch`] if the process cannot start or exits early
    /// - [`crate::UnpackError::OepNotFound`] / [`crate::UnpackError::TargetCrashed`] from tracing
    /// - [`crate::UnpackError::Reconstruction`] when the image cannot be rebuilt
    pub fn run_on(
        &mut self,
        target: &TargetFile,
        controller: &mut dyn ProcessController,
        clock: &dyn Clock,
    ) -> Result<UnpackReport>
    {
        let headers = &target.headers;
        let request = ProfileRequest {
            declared: self.config.forced_version,
            probed: probe::detect(target),
            architecture: headers.architecture,
            format: headers.format,
            kind: headers.kind,
        };
        let mut profile = profile::select(&request)?;
        if let Some(timeout) = self.config.timeout {
            profile.timeout = timeout;
        }

        let launch = LaunchTarget {
            path: self.config.target.clone(),
            args: self.config.args.clone(),
            kind: headers.kind,
            architecture: headers.architecture,
        };
        let session = controller.launch(&launch)?;
        info!("Launched {} as pid {}", launch.path.display(), session.pid);

        let mut detector = OepDetector::new(profile.clone(), &launch.module_name(), session.peb, self.config.forced_oep);
        let traced = oep::trace_to_oep(controller, &mut detector, clock);
        let outcome = match traced {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(kill) = controller.terminate() {
                    warn!("Failed to terminate target: {kill}");
                }
                return Err(e);
            }
        };

        if self.config.pause_on_oep {
            info!("Paused at OEP {}", outcome.oep.address);
            if let Some(hook) = self.on_oep.as_mut() {
                hook(&outcome.oep);
            }
        }
        if let Err(e) = controller.terminate() {
            warn!("Failed to terminate target: {e}");
        }

        let imports = if self.config.skip_imports {
            info!("Import resolution skipped");
            ImportTable::empty()
        } else {
            imports::resolve(&outcome.snapshot, &profile)
        };
        let image = reconstruct::build(&outcome.snapshot, outcome.oep.address, &imports)?;
        if profile.low_confidence {
            warn!("Results come from the generic profile and may be incomplete");
        }

        Ok(UnpackReport {
            profile,
            oep: outcome.oep,
            transitions: detector.transitions().to_vec(),
            imports,
            image,
        })
    }
}
