//! The environment coordinator: turn a specification into a restored
//! working copy, pulling or importing the catalog when someone else already
//! built it and recording a freshly staged build when nobody did.

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::*;

use crate::blueprint;
use crate::context::current_platform;
use crate::error::HoloError;
use crate::library::Library;
use crate::restore::RestoreSummary;

/// Timeline milestones, emitted in order as phases complete. An out-of-core
/// progress reporter consumes these; nothing here blocks on them.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Event {
    BlueprintReady,
    StagePrepared,
    RecordComplete,
    RestoreComplete,
    PreRunComplete,
    RobotStarts,
    RobotEnds,
}

#[derive(Debug, Default)]
pub struct Timeline {
    events: Mutex<Vec<(Event, DateTime<Utc>)>>,
}

impl Timeline {
    pub fn emit(&self, event: Event) {
        trace!("Timeline: {event:?}");
        self.events.lock().unwrap().push((event, Utc::now()));
    }

    pub fn snapshot(&self) -> Vec<(Event, DateTime<Utc>)> {
        self.events.lock().unwrap().clone()
    }
}

/// Fetches a catalog (and its blobs) from somewhere else: a cloud bucket,
/// a peer, anything. Failures are advisory; the coordinator falls through
/// to building locally.
pub type CatalogPuller<'a> = dyn Fn(&str, &str, bool) -> Result<()> + 'a;

/// What `new_environment` did and how dirty the space was.
#[derive(Debug, Default, Clone)]
pub struct Scorecard {
    pub identity: String,
    pub recorded: bool,
    pub restored: bool,
    pub restore: RestoreSummary,
}

pub struct Coordinator<'a> {
    library: &'a Library,
    timeline: Timeline,
    controller: String,
}

impl<'a> Coordinator<'a> {
    pub fn new(library: &'a Library, controller: impl Into<String>) -> Self {
        Self {
            library,
            timeline: Timeline::default(),
            controller: controller.into(),
        }
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    /// The whole pipeline: canonicalize the specification, make sure its catalog is
    /// in the library (pull → zip import → record-from-stage, in that
    /// order), and optionally restore it into a space named after the
    /// blueprint.
    ///
    /// Returns the environment label and a scorecard of what happened.
    pub fn new_environment(
        &self,
        spec_text: &str,
        holozip: Option<&Utf8Path>,
        restore: bool,
        force: bool,
        puller: Option<&CatalogPuller>,
    ) -> Result<(String, Scorecard)> {
        let blueprint = blueprint::canonical(spec_text);
        let identity = blueprint::hash(&blueprint);
        let label = format!("{}_{}", current_platform(), &identity[..16]);
        self.timeline.emit(Event::BlueprintReady);
        debug!("Environment {label} wanted (force: {force})");

        let mut scorecard = Scorecard {
            identity: identity.clone(),
            ..Scorecard::default()
        };

        if force || !self.library.has_blueprint(&blueprint) {
            self.ensure_catalog(&blueprint, &identity, holozip, force, puller, &mut scorecard)
                .map_err(tag_failure)?;
        }

        if restore {
            let (path, summary) = self
                .library
                .restore_full(&blueprint, &self.controller, &label, false)
                .map_err(tag_failure)?;
            self.timeline.emit(Event::RestoreComplete);
            scorecard.restored = true;
            scorecard.restore = summary;
            debug!("Environment {label} live at {path}");
        }

        self.timeline.emit(Event::PreRunComplete);
        Ok((label, scorecard))
    }

    fn ensure_catalog(
        &self,
        blueprint: &[u8],
        identity: &str,
        holozip: Option<&Utf8Path>,
        force: bool,
        puller: Option<&CatalogPuller>,
        scorecard: &mut Scorecard,
    ) -> Result<()> {
        if let Some(puller) = puller {
            // Plugin failures are warnings, not verdicts.
            match puller("cloud", identity, force) {
                Ok(()) => trace!("Puller looked for {identity}"),
                Err(e) => warn!("Catalog pull of {identity} failed: {e:#}"),
            }
            if self.library.has_blueprint(blueprint) {
                return Ok(());
            }
        }

        if let Some(zip) = holozip {
            let imported = self
                .library
                .import_zip(zip)
                .with_context(|| format!("Couldn't import {zip}"))?;
            debug!("Imported {} catalog(s) from {zip}", imported.len());
            if self.library.has_blueprint(blueprint) {
                return Ok(());
            }
        }

        // Last resort: an external builder has (hopefully) staged this
        // environment; lift it.
        let staged = self.library.stage()?;
        if !stage_is_populated(&staged) {
            return Err(anyhow::Error::new(HoloError::NotFound(identity.to_owned())).context(
                format!("No catalog for this blueprint and nothing staged at {staged}"),
            ));
        }
        self.timeline.emit(Event::StagePrepared);
        self.library
            .record(blueprint, &self.controller, identity)?;
        self.timeline.emit(Event::RecordComplete);
        scorecard.recorded = true;
        Ok(())
    }

    /// Bracketing events for the tenant actually running in the space.
    pub fn robot_starts(&self) {
        self.timeline.emit(Event::RobotStarts);
    }

    pub fn robot_ends(&self) {
        self.timeline.emit(Event::RobotEnds);
    }
}

/// Stamp outward-bound failures with their remediation tag; an outer
/// settings provider turns the tag into a documentation link.
fn tag_failure(err: anyhow::Error) -> anyhow::Error {
    match crate::error::remediation_tag(&err) {
        Some(tag) => err.context(format!("see: {tag}")),
        None => err,
    }
}

fn stage_is_populated(staged: &Utf8Path) -> bool {
    std::fs::read_dir(staged)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::HolotreeContext;
    use crate::file_util;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample() -> (tempfile::TempDir, Library) {
        let dir = tempfile::tempdir().unwrap();
        let home = file_util::utf8(dir.path()).unwrap().to_owned();
        let lib = Library::open(HolotreeContext::new(home));
        (dir, lib)
    }

    fn stage_something(lib: &Library) {
        let staged = lib.stage().unwrap();
        fs::write(staged.join("main.py"), b"print('main')\n").unwrap();
    }

    #[test]
    fn builds_and_restores_from_stage() -> Result<()> {
        let (_dir, lib) = sample();
        stage_something(&lib);

        let coordinator = Coordinator::new(&lib, "ctrl");
        let (label, scorecard) =
            coordinator.new_environment("dependencies:\n  - python\n", None, true, false, None)?;

        assert!(label.starts_with(&current_platform()));
        assert!(scorecard.recorded);
        assert!(scorecard.restored);
        assert_eq!(scorecard.restore.dirty_files, 1);

        let events: Vec<Event> = coordinator
            .timeline()
            .snapshot()
            .into_iter()
            .map(|(e, _)| e)
            .collect();
        assert_eq!(
            events,
            vec![
                Event::BlueprintReady,
                Event::StagePrepared,
                Event::RecordComplete,
                Event::RestoreComplete,
                Event::PreRunComplete,
            ]
        );
        Ok(())
    }

    #[test]
    fn second_run_skips_record() -> Result<()> {
        let (_dir, lib) = sample();
        stage_something(&lib);

        let coordinator = Coordinator::new(&lib, "ctrl");
        let spec = "dependencies:\n  - python\n";
        coordinator.new_environment(spec, None, true, false, None)?;
        let (_, scorecard) = coordinator.new_environment(spec, None, true, false, None)?;
        assert!(!scorecard.recorded);
        assert_eq!(scorecard.restore.dirty_files, 0);
        Ok(())
    }

    #[test]
    fn failing_puller_is_only_a_warning() -> Result<()> {
        let (_dir, lib) = sample();
        stage_something(&lib);

        let calls = AtomicUsize::new(0);
        let puller = |origin: &str, catalog: &str, _force: bool| -> Result<()> {
            calls.fetch_add(1, Ordering::Relaxed);
            anyhow::bail!("no route to {origin} for {catalog}")
        };

        let coordinator = Coordinator::new(&lib, "ctrl");
        let (_, scorecard) =
            coordinator.new_environment("dependencies:\n  - python\n", None, false, false, Some(&puller))?;
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert!(scorecard.recorded);
        assert!(!scorecard.restored);
        Ok(())
    }

    #[test]
    fn nothing_staged_is_not_found() {
        let (_dir, lib) = sample();
        let coordinator = Coordinator::new(&lib, "ctrl");
        let err = coordinator
            .new_environment("dependencies:\n  - python\n", None, false, false, None)
            .unwrap_err();
        assert!(crate::error::is_not_found(&err));
    }
}
