//! Garbage collection entry points: rules, mark runs, the uncommitted scan
//! and the sweep.

use std::collections::BTreeSet;

use chrono::Utc;
use tracing::{info, warn};

use crate::cancel::CancelFlag;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::gc::{
    compute_closure, mark_commits, read_report, sweep, write_report, GarbageCollectionRules, GcReport, GcRun,
    GcRunState, PhysicalObject, PhysicalObjectStore, SweepReport, UncommittedGcPage, UncommittedScanner,
};
use crate::refs::Repository;
use crate::storage::{BranchName, CommitId, RepositoryName};

const RULES_SETTING: &str = "gc_rules";

fn run_setting(run_id: &str) -> String {
    format!("gc_runs/{}", run_id)
}

/// Hides the engine's own metadata from a sweep; only data objects are
/// candidates for deletion.
struct DataObjects<'a> {
    inner: &'a dyn PhysicalObjectStore,
    metadata_prefix: String,
}

impl PhysicalObjectStore for DataObjects<'_> {
    fn list(&self, namespace: &str) -> Result<Vec<PhysicalObject>> {
        let mut objects = self.inner.list(namespace)?;
        objects.retain(|o| !o.address.starts_with(&self.metadata_prefix));
        Ok(objects)
    }

    fn delete(&self, namespace: &str, address: &str) -> Result<()> {
        self.inner.delete(namespace, address)
    }
}

impl Engine {
    pub fn get_gc_rules(&self, repository: &RepositoryName) -> Result<Option<GarbageCollectionRules>> {
        self.repository(repository)?;
        self.inner.refs.get_setting(repository, RULES_SETTING)
    }

    pub fn set_gc_rules(&self, repository: &RepositoryName, rules: &GarbageCollectionRules) -> Result<()> {
        self.repository(repository)?;
        rules.validate()?;
        self.inner.refs.set_setting(repository, RULES_SETTING, rules)?;
        info!(repository = %repository, default_retention_days = rules.default_retention_days, "set gc rules");
        Ok(())
    }

    pub fn delete_gc_rules(&self, repository: &RepositoryName) -> Result<()> {
        self.repository(repository)?;
        self.inner.refs.delete_setting(repository, RULES_SETTING)
    }

    pub fn get_gc_run(&self, repository: &RepositoryName, run_id: &str) -> Result<GcRun> {
        self.repository(repository)?;
        self.inner
            .refs
            .get_setting(repository, &run_setting(run_id))?
            .ok_or_else(|| Error::InvalidValue(format!("unknown gc run: {}", run_id)))
    }

    fn save_gc_run(&self, repository: &RepositoryName, run: &GcRun) -> Result<()> {
        self.inner.refs.set_setting(repository, &run_setting(&run.run_id), run)
    }

    /// Run the commit mark and store its report.
    ///
    /// Pass the id of a failed or interrupted run to retry it; a completed
    /// run is returned unchanged.
    pub fn prepare_gc_commits(
        &self,
        repository: &RepositoryName,
        run_id: Option<&str>,
        cancel: &CancelFlag,
    ) -> Result<GcRun> {
        let repo = self.repository(repository)?;
        let mut run = match run_id {
            Some(id) => self.get_gc_run(repository, id)?,
            None => GcRun::new(),
        };
        if run.state == GcRunState::Completed {
            return Ok(run);
        }
        run.start()?;
        self.save_gc_run(repository, &run)?;

        match self.mark_and_report(&repo, &run.run_id, cancel) {
            Ok(location) => {
                run.complete(location)?;
                self.save_gc_run(repository, &run)?;
                Ok(run)
            }
            Err(e) => {
                warn!(repository = %repository, run_id = %run.run_id, error = %e, "gc mark failed");
                run.fail(e.to_string());
                self.save_gc_run(repository, &run)?;
                Err(e)
            }
        }
    }

    fn mark_and_report(&self, repo: &Repository, run_id: &str, cancel: &CancelFlag) -> Result<String> {
        let namespace = repo.storage_namespace.as_str();
        let heads: Vec<(BranchName, CommitId)> = self
            .inner
            .refs
            .list_branches(&repo.name, "", None, usize::MAX)?
            .into_iter()
            .map(|(name, branch)| (name, branch.commit_id))
            .collect();
        let tagged: Vec<CommitId> = self
            .inner
            .refs
            .list_tags(&repo.name, "", None, usize::MAX)?
            .into_iter()
            .map(|tag| tag.commit_id)
            .collect();
        let rules: GarbageCollectionRules = self
            .inner
            .refs
            .get_setting(&repo.name, RULES_SETTING)?
            .unwrap_or_default();

        let mark = mark_commits(&self.inner.commits, namespace, &heads, &tagged, &rules, Utc::now(), cancel)?;
        let closure = compute_closure(&self.inner.commits, &self.inner.metaranges, namespace, &mark.retained, cancel)?;
        let report = GcReport {
            run_id: run_id.to_string(),
            created_at: Utc::now(),
            retained_commits: mark.retained,
            expired_commits: mark.expired,
            closure,
        };
        let location = write_report(self.inner.store.as_ref(), namespace, self.prefix(), &report)?;
        info!(
            repository = %repo.name,
            run_id,
            retained = report.retained_commits.len(),
            expired = report.expired_commits.len(),
            addresses = report.closure.physical_addresses.len(),
            location = %location,
            "gc mark complete"
        );
        Ok(location)
    }

    /// The report of a completed run.
    pub fn get_gc_report(&self, repository: &RepositoryName, run_id: &str) -> Result<GcReport> {
        let repo = self.repository(repository)?;
        let run = self.get_gc_run(repository, run_id)?;
        let location = run
            .report_location
            .ok_or_else(|| Error::InvalidValue(format!("gc run {} has no report", run_id)))?;
        read_report(self.inner.store.as_ref(), &repo.storage_namespace, &location)
    }

    /// Next page of addresses referenced only by staging or outstanding
    /// link addresses. Start with `mark = None` and pass each page's
    /// continuation until it is `None`.
    pub fn prepare_uncommitted_gc(
        &self,
        repository: &RepositoryName,
        mark: Option<&str>,
        cancel: &CancelFlag,
    ) -> Result<UncommittedGcPage> {
        let repo = self.repository(repository)?;
        let scanner = UncommittedScanner {
            refs: &self.inner.refs,
            staging: &self.inner.staging,
            commits: &self.inner.commits,
            metaranges: &self.inner.metaranges,
            store: self.inner.store.clone(),
            prefix: self.prefix(),
            page_size: self.inner.config.scan_batch_size,
        };
        scanner.scan(&repo, mark, self.inner.config.link_address_expiry(), Utc::now(), cancel)
    }

    /// Delete data objects that neither the run's report nor `uncommitted`
    /// keeps, once they are older than the configured grace period.
    pub fn sweep_objects(
        &self,
        repository: &RepositoryName,
        objects: &dyn PhysicalObjectStore,
        run_id: &str,
        uncommitted: &BTreeSet<String>,
        cancel: &CancelFlag,
    ) -> Result<SweepReport> {
        let repo = self.repository(repository)?;
        let report = self.get_gc_report(repository, run_id)?;
        let data = DataObjects {
            inner: objects,
            metadata_prefix: format!("{}/", self.prefix()),
        };
        sweep(
            &data,
            &repo.storage_namespace,
            &[&report.closure.physical_addresses, uncommitted],
            self.inner.config.gc_grace_period(),
            Utc::now(),
            cancel,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{DateTime, Duration};
    use parking_lot::Mutex;

    use super::*;
    use crate::engine::CommitParams;
    use crate::storage::{Entry, Key};

    fn setup() -> (Engine, RepositoryName) {
        let engine = Engine::in_memory();
        let repo = RepositoryName::new("repo").unwrap();
        engine
            .create_repository(&repo, "mem://repo", &BranchName::main())
            .unwrap();
        (engine, repo)
    }

    fn stage(engine: &Engine, repo: &RepositoryName, path: &str, addr: &str) {
        engine
            .stage_entry(repo, &BranchName::main(), &Key::new(path).unwrap(), Entry::new(addr, 1, "c"))
            .unwrap();
    }

    #[derive(Default)]
    struct Objects {
        objects: Mutex<BTreeMap<String, DateTime<Utc>>>,
    }

    impl PhysicalObjectStore for Objects {
        fn list(&self, _namespace: &str) -> Result<Vec<PhysicalObject>> {
            Ok(self
                .objects
                .lock()
                .iter()
                .map(|(address, modified)| PhysicalObject {
                    address: address.clone(),
                    last_modified: *modified,
                })
                .collect())
        }

        fn delete(&self, _namespace: &str, address: &str) -> Result<()> {
            self.objects.lock().remove(address);
            Ok(())
        }
    }

    #[test]
    fn test_rules_roundtrip() {
        let (engine, repo) = setup();
        assert_eq!(engine.get_gc_rules(&repo).unwrap(), None);
        let rules = GarbageCollectionRules::new(7).with_branch(BranchName::main(), 30);
        engine.set_gc_rules(&repo, &rules).unwrap();
        assert_eq!(engine.get_gc_rules(&repo).unwrap(), Some(rules));
        engine.delete_gc_rules(&repo).unwrap();
        assert_eq!(engine.get_gc_rules(&repo).unwrap(), None);
    }

    #[test]
    fn test_prepare_gc_commits() {
        let (engine, repo) = setup();
        let main = BranchName::main();
        let old = Utc::now() - Duration::days(30);
        let initial = engine.get_branch(&repo, &main).unwrap().commit_id;
        stage(&engine, &repo, "a", "data/a");
        let c1 = engine
            .commit(&repo, &main, CommitParams::new("c1").creation_date(old))
            .unwrap();
        stage(&engine, &repo, "b", "data/b");
        let c2 = engine
            .commit(&repo, &main, CommitParams::new("c2").creation_date(old))
            .unwrap();

        let run = engine
            .prepare_gc_commits(&repo, None, &CancelFlag::new())
            .unwrap();
        assert_eq!(run.state, GcRunState::Completed);
        assert_eq!(engine.get_gc_run(&repo, &run.run_id).unwrap(), run);

        let report = engine.get_gc_report(&repo, &run.run_id).unwrap();
        assert_eq!(report.retained_commits, BTreeSet::from([c2.id]));
        assert_eq!(report.expired_commits, BTreeSet::from([initial, c1.id]));
        let addresses: Vec<&str> = report.closure.physical_addresses.iter().map(String::as_str).collect();
        assert_eq!(addresses, vec!["data/a", "data/b"]);

        // a completed run is not redone
        let again = engine
            .prepare_gc_commits(&repo, Some(&run.run_id), &CancelFlag::new())
            .unwrap();
        assert_eq!(again, run);
        assert!(matches!(
            engine.prepare_gc_commits(&repo, Some("missing"), &CancelFlag::new()),
            Err(Error::InvalidValue(_))
        ));
    }

    #[test]
    fn test_failed_run_is_retried() {
        let (engine, repo) = setup();
        let mut run = GcRun::new();
        run.fail("interrupted");
        engine.save_gc_run(&repo, &run).unwrap();

        let cancel = CancelFlag::new();
        cancel.cancel();
        assert!(matches!(
            engine.prepare_gc_commits(&repo, Some(&run.run_id), &cancel),
            Err(Error::Cancelled)
        ));
        let failed = engine.get_gc_run(&repo, &run.run_id).unwrap();
        assert_eq!(failed.state, GcRunState::Failed);
        assert!(failed.error.is_some());

        let done = engine
            .prepare_gc_commits(&repo, Some(&run.run_id), &CancelFlag::new())
            .unwrap();
        assert_eq!(done.run_id, run.run_id);
        assert_eq!(done.state, GcRunState::Completed);
        assert!(done.error.is_none());
    }

    #[test]
    fn test_uncommitted_and_sweep() {
        let (engine, repo) = setup();
        let main = BranchName::main();
        stage(&engine, &repo, "a", "data/a");
        engine.commit(&repo, &main, CommitParams::new("c1")).unwrap();
        stage(&engine, &repo, "u", "data/u");

        let page = engine
            .prepare_uncommitted_gc(&repo, None, &CancelFlag::new())
            .unwrap();
        assert!(page.continuation.is_none());
        assert_eq!(page.addresses, BTreeSet::from(["data/u".to_string()]));

        let run = engine
            .prepare_gc_commits(&repo, None, &CancelFlag::new())
            .unwrap();

        let now = Utc::now();
        let old = now - Duration::days(2);
        let objects = Objects::default();
        {
            let mut map = objects.objects.lock();
            for address in ["data/a", "data/u", "data/garbage", "_data/commits/abc"] {
                map.insert(address.to_string(), old);
            }
            map.insert("data/fresh".to_string(), now);
        }

        let swept = engine
            .sweep_objects(&repo, &objects, &run.run_id, &page.addresses, &CancelFlag::new())
            .unwrap();
        assert_eq!(swept.deleted, vec!["data/garbage".to_string()]);
        assert_eq!(swept.skipped_recent, 1);
        let left: Vec<String> = objects.objects.lock().keys().cloned().collect();
        assert_eq!(left, vec!["_data/commits/abc", "data/a", "data/fresh", "data/u"]);
    }
}
