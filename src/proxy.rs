//! The top-level coordinator: write path, placement lookup, query admission
//! and the migration control plane.

use crate::admission::QueryGate;
use crate::backend::Backend;
use crate::circle::Circle;
use crate::config::ProxyConfig;
use crate::line::{self, Precision};
use crate::migrate::{MigrationInfo, MigrationTables, Workflow};
use crate::{Error, Result};

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{info, warn};

pub struct Proxy {
    circles: Vec<Arc<Circle>>,
    db_list: Vec<String>,
    db_set: HashSet<String>,
    gate: QueryGate,
    status: MigrationTables,
    flush_size: usize,
    flush_time: Duration,
}

impl Proxy {
    /// Build the proxy from a validated config. Workers are not started
    /// until [`Proxy::spawn_workers`] is called.
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            Error::Config(format!(
                "cannot create data_dir {}: {e}",
                config.data_dir.display()
            ))
        })?;
        let mut circles = Vec::with_capacity(config.circles.len());
        for (circle_num, circle_config) in config.circles.iter().enumerate() {
            circles.push(Arc::new(Circle::new(
                circle_config,
                circle_num,
                &config.db_list,
                &config.data_dir,
                config.vnode_size,
                config.migrate_max_cpus.max(1),
            )?));
        }
        let db_set = config.db_list.iter().cloned().collect();
        Ok(Self {
            circles,
            db_list: config.db_list.clone(),
            db_set,
            gate: QueryGate::default_rules(),
            status: MigrationTables::new(config.circles.len()),
            flush_size: config.flush_size,
            flush_time: config.flush_time,
        })
    }

    /// Start the three perpetual workers of every backend.
    pub fn spawn_workers(&self) {
        for circle in &self.circles {
            for backend in circle.backends() {
                backend.spawn_workers(self.flush_time);
            }
        }
    }

    pub fn circles(&self) -> &[Arc<Circle>] {
        &self.circles
    }

    pub fn db_list(&self) -> &[String] {
        &self.db_list
    }

    pub fn gate(&self) -> &QueryGate {
        &self.gate
    }

    pub fn check_measurement_query(&self, q: &str) -> bool {
        self.gate.check_measurement_query(q)
    }

    pub fn check_cluster_query(&self, q: &str) -> bool {
        self.gate.check_cluster_query(q)
    }

    pub fn check_create_database_query(&self, q: &str) -> bool {
        self.gate.check_create_database_query(q)
    }

    pub fn status(&self) -> &MigrationTables {
        &self.status
    }

    fn circle(&self, circle_num: usize) -> Result<Arc<Circle>> {
        self.circles
            .get(circle_num)
            .cloned()
            .ok_or(Error::UnknownCircle(circle_num))
    }

    fn dbs_or_default(&self, dbs: Vec<String>) -> Vec<String> {
        if dbs.is_empty() {
            self.db_list.clone()
        } else {
            dbs
        }
    }

    /// One backend per circle for a routing key, skipping circles whose ring
    /// lookup fails.
    pub fn backends_for_key(&self, key: &str) -> Vec<Arc<Backend>> {
        let mut backends = Vec::with_capacity(self.circles.len());
        for circle in &self.circles {
            match circle.route(key) {
                Ok(backend) => backends.push(backend),
                Err(e) => {
                    warn!(circle = circle.circle_num, key, error = %e, "routing failed, skipping circle");
                }
            }
        }
        backends
    }

    /// The write path: canonicalize, derive the routing key, enqueue to one
    /// backend per circle. A malformed line is logged and dropped; a failing
    /// circle is logged while the remaining circles still receive the write.
    pub async fn write_data(&self, db: &str, line: &[u8], precision: Option<Precision>) -> Result<()> {
        if !self.db_set.contains(db) {
            return Err(Error::DatabaseNotAllowed(db.to_string()));
        }
        let line = line::to_nanos(line, precision);
        let measurement = match line::scan_measurement(&line) {
            Ok(m) => m,
            Err(e) => {
                warn!(db, error = %e, "dropping malformed write line");
                return Ok(());
            }
        };
        let key = format!("{db},{measurement}");
        for circle in &self.circles {
            match circle.route(&key) {
                Ok(backend) => {
                    if let Err(e) = backend.enqueue(db, &line, self.flush_size).await {
                        warn!(circle = circle.circle_num, url = %backend.url, error = %e, "enqueue failed");
                    }
                }
                Err(e) => {
                    warn!(circle = circle.circle_num, key, error = %e, "routing failed, skipping circle");
                }
            }
        }
        Ok(())
    }

    /// Migrating flags of every circle, for the control plane.
    pub fn migrating_state(&self) -> BTreeMap<String, bool> {
        self.circles
            .iter()
            .map(|c| (c.name.clone(), c.is_migrating()))
            .collect()
    }

    /// Snapshot one workflow's status table.
    pub fn migration_status(&self, workflow: Workflow) -> Vec<BTreeMap<String, MigrationInfo>> {
        self.status.snapshot(workflow)
    }

    /// Re-align placement inside one circle after a membership change: every
    /// measurement on a source backend whose routed home is elsewhere is
    /// copied there.
    pub async fn rebalance(
        self: &Arc<Self>,
        circle_num: usize,
        backend_urls: &[String],
        dbs: Vec<String>,
    ) -> Result<()> {
        let circle = self.circle(circle_num)?;
        let sources = if backend_urls.is_empty() {
            circle.backends().to_vec()
        } else {
            backend_urls
                .iter()
                .map(|url| circle.backend_by_url(url))
                .collect::<Result<Vec<_>>>()?
        };
        let dbs = self.dbs_or_default(dbs);

        self.status.clear(Workflow::Rebalance, circle_num);
        circle.set_migrating(true);
        let mut workers = JoinSet::new();
        for backend in sources {
            let proxy = Arc::clone(self);
            let circle = Arc::clone(&circle);
            let dbs = dbs.clone();
            workers.spawn(async move { proxy.rebalance_backend(circle, backend, dbs).await });
        }
        while workers.join_next().await.is_some() {}
        circle.set_migrating(false);
        info!(circle = circle_num, "rebalance done");
        Ok(())
    }

    async fn rebalance_backend(
        self: Arc<Self>,
        circle: Arc<Circle>,
        src: Arc<Backend>,
        dbs: Vec<String>,
    ) {
        let circle_num = circle.circle_num;
        let url = src.url.clone();
        self.status
            .update(Workflow::Rebalance, circle_num, &url, |info| {
                info.circle_num = circle_num;
            });
        let Ok(limit) = circle.migrate_limit(&url) else {
            return;
        };
        let mut migrations = JoinSet::new();
        for db in dbs {
            self.status
                .update(Workflow::Rebalance, circle_num, &url, |info| {
                    info.database = db.clone();
                });
            let measurements = match src.get_measurements(&db).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(url = %url, db, error = %e, "listing measurements failed");
                    continue;
                }
            };
            self.status
                .update(Workflow::Rebalance, circle_num, &url, |info| {
                    info.backend_measure_total += measurements.len();
                });
            for measurement in measurements {
                self.status
                    .update(Workflow::Rebalance, circle_num, &url, |info| {
                        info.measurement = measurement.clone();
                    });
                let key = format!("{db},{measurement}");
                let target = match circle.route_url(&key) {
                    Ok(t) => t.to_string(),
                    Err(e) => {
                        warn!(circle = circle_num, key, error = %e, "routing failed");
                        self.status
                            .update(Workflow::Rebalance, circle_num, &url, |info| {
                                info.not_migrate += 1;
                            });
                        continue;
                    }
                };
                if target == url {
                    self.status
                        .update(Workflow::Rebalance, circle_num, &url, |info| {
                            info.not_migrate += 1;
                        });
                    continue;
                }
                self.status
                    .update(Workflow::Rebalance, circle_num, &url, |info| {
                        info.need_migrate += 1;
                    });
                let Ok(dst) = circle.backend_by_url(&target) else {
                    warn!(circle = circle_num, target, "destination missing from circle index");
                    continue;
                };
                let Ok(permit) = Arc::clone(&limit).acquire_owned().await else {
                    break;
                };
                let circle = Arc::clone(&circle);
                let src = Arc::clone(&src);
                let db = db.clone();
                migrations.spawn(async move {
                    let _permit = permit;
                    if let Err(e) = circle.migrate(&src, &[dst], &db, &measurement, 0).await {
                        warn!(src = %src.url, db, measurement, error = %e, "migration failed");
                    }
                });
            }
        }
        while migrations.join_next().await.is_some() {}
    }

    /// Restore a set of target backends in `to_circle` by copying from the
    /// peer circle `from_circle`. An empty target set means every backend of
    /// the destination circle.
    pub async fn recovery(
        self: &Arc<Self>,
        from_circle: usize,
        to_circle: usize,
        target_urls: &[String],
        dbs: Vec<String>,
    ) -> Result<()> {
        if from_circle == to_circle {
            return Err(Error::Config(
                "recovery requires two distinct circles".to_string(),
            ));
        }
        let from = self.circle(from_circle)?;
        let to = self.circle(to_circle)?;
        let targets: HashSet<String> = if target_urls.is_empty() {
            to.backends().iter().map(|b| b.url.clone()).collect()
        } else {
            target_urls.iter().cloned().collect()
        };
        let dbs = self.dbs_or_default(dbs);

        self.status.clear(Workflow::Recovery, from_circle);
        from.set_migrating(true);
        to.set_migrating(true);
        let mut workers = JoinSet::new();
        for backend in from.backends() {
            let proxy = Arc::clone(self);
            let from = Arc::clone(&from);
            let to = Arc::clone(&to);
            let backend = Arc::clone(backend);
            let targets = targets.clone();
            let dbs = dbs.clone();
            workers.spawn(async move {
                proxy.recovery_backend(from, to, backend, targets, dbs).await;
            });
        }
        while workers.join_next().await.is_some() {}
        from.set_migrating(false);
        to.set_migrating(false);
        info!(from = from_circle, to = to_circle, "recovery done");
        Ok(())
    }

    async fn recovery_backend(
        self: Arc<Self>,
        from: Arc<Circle>,
        to: Arc<Circle>,
        src: Arc<Backend>,
        targets: HashSet<String>,
        dbs: Vec<String>,
    ) {
        let circle_num = from.circle_num;
        let url = src.url.clone();
        self.status
            .update(Workflow::Recovery, circle_num, &url, |info| {
                info.circle_num = circle_num;
            });
        let Ok(limit) = from.migrate_limit(&url) else {
            return;
        };
        let mut migrations = JoinSet::new();
        for db in dbs {
            self.status
                .update(Workflow::Recovery, circle_num, &url, |info| {
                    info.database = db.clone();
                });
            let measurements = match src.get_measurements(&db).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(url = %url, db, error = %e, "listing measurements failed");
                    continue;
                }
            };
            self.status
                .update(Workflow::Recovery, circle_num, &url, |info| {
                    info.backend_measure_total += measurements.len();
                });
            for measurement in measurements {
                self.status
                    .update(Workflow::Recovery, circle_num, &url, |info| {
                        info.measurement = measurement.clone();
                    });
                let key = format!("{db},{measurement}");
                let needed = match to.route_url(&key) {
                    Ok(target) if targets.contains(target) => Some(target.to_string()),
                    Ok(_) => None,
                    Err(e) => {
                        warn!(to_circle = to.circle_num, key, error = %e, "routing failed");
                        None
                    }
                };
                let Some(target) = needed else {
                    self.status
                        .update(Workflow::Recovery, circle_num, &url, |info| {
                            info.not_migrate += 1;
                        });
                    continue;
                };
                self.status
                    .update(Workflow::Recovery, circle_num, &url, |info| {
                        info.need_migrate += 1;
                    });
                let Ok(dst) = to.backend_by_url(&target) else {
                    warn!(to_circle = to.circle_num, target, "destination missing from circle index");
                    continue;
                };
                let Ok(permit) = Arc::clone(&limit).acquire_owned().await else {
                    break;
                };
                let from = Arc::clone(&from);
                let src = Arc::clone(&src);
                let db = db.clone();
                migrations.spawn(async move {
                    let _permit = permit;
                    if let Err(e) = from.migrate(&src, &[dst], &db, &measurement, 0).await {
                        warn!(src = %src.url, db, measurement, error = %e, "migration failed");
                    }
                });
            }
        }
        while migrations.join_next().await.is_some() {}
    }

    /// Make every circle mutually consistent: each backend's measurements
    /// are copied to the routed backend of every other circle, bounded by
    /// `last_seconds` (0 = all time).
    pub async fn resync(self: &Arc<Self>, dbs: Vec<String>, last_seconds: u64) -> Result<()> {
        let dbs = self.dbs_or_default(dbs);
        for circle in &self.circles {
            self.status.clear(Workflow::Resync, circle.circle_num);
            circle.set_migrating(true);
            let mut workers = JoinSet::new();
            for backend in circle.backends() {
                let proxy = Arc::clone(self);
                let circle = Arc::clone(circle);
                let backend = Arc::clone(backend);
                let dbs = dbs.clone();
                workers.spawn(async move {
                    proxy.resync_backend(circle, backend, dbs, last_seconds).await;
                });
            }
            while workers.join_next().await.is_some() {}
            circle.set_migrating(false);
            info!(circle = circle.circle_num, name = %circle.name, "resync circle done");
        }
        info!("resync done");
        Ok(())
    }

    async fn resync_backend(
        self: Arc<Self>,
        circle: Arc<Circle>,
        src: Arc<Backend>,
        dbs: Vec<String>,
        last_seconds: u64,
    ) {
        let circle_num = circle.circle_num;
        let url = src.url.clone();
        self.status
            .update(Workflow::Resync, circle_num, &url, |info| {
                info.circle_num = circle_num;
            });
        let Ok(limit) = circle.migrate_limit(&url) else {
            return;
        };
        let mut migrations = JoinSet::new();
        for db in dbs {
            self.status
                .update(Workflow::Resync, circle_num, &url, |info| {
                    info.database = db.clone();
                });
            let measurements = match src.get_measurements(&db).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(url = %url, db, error = %e, "listing measurements failed");
                    continue;
                }
            };
            self.status
                .update(Workflow::Resync, circle_num, &url, |info| {
                    info.backend_measure_total += measurements.len();
                });
            for measurement in measurements {
                self.status
                    .update(Workflow::Resync, circle_num, &url, |info| {
                        info.measurement = measurement.clone();
                    });
                let key = format!("{db},{measurement}");
                let mut dsts = Vec::new();
                for other in &self.circles {
                    if other.circle_num == circle_num {
                        continue;
                    }
                    match other.route(&key) {
                        Ok(dst) => dsts.push(dst),
                        Err(e) => {
                            warn!(circle = other.circle_num, key, error = %e, "routing failed");
                        }
                    }
                }
                if dsts.is_empty() {
                    self.status
                        .update(Workflow::Resync, circle_num, &url, |info| {
                            info.not_migrate += 1;
                        });
                    continue;
                }
                self.status
                    .update(Workflow::Resync, circle_num, &url, |info| {
                        info.need_migrate += 1;
                    });
                let Ok(permit) = Arc::clone(&limit).acquire_owned().await else {
                    break;
                };
                let circle = Arc::clone(&circle);
                let src = Arc::clone(&src);
                let db = db.clone();
                migrations.spawn(async move {
                    let _permit = permit;
                    if let Err(e) = circle
                        .migrate(&src, &dsts, &db, &measurement, last_seconds)
                        .await
                    {
                        warn!(src = %src.url, db, measurement, error = %e, "migration failed");
                    }
                });
            }
        }
        while migrations.join_next().await.is_some() {}
    }

    /// Drop from every backend of one circle the measurements whose routed
    /// home is elsewhere. Run after a rebalance has copied the data away.
    pub async fn clear_measurements(self: &Arc<Self>, circle_num: usize, dbs: Vec<String>) -> Result<()> {
        let circle = self.circle(circle_num)?;
        let dbs = self.dbs_or_default(dbs);
        let mut workers = JoinSet::new();
        for backend in circle.backends() {
            let circle = Arc::clone(&circle);
            let backend = Arc::clone(backend);
            let dbs = dbs.clone();
            workers.spawn(async move { clear_backend(circle, backend, dbs).await });
        }
        while workers.join_next().await.is_some() {}
        info!(circle = circle_num, "clear done");
        Ok(())
    }
}

async fn clear_backend(circle: Arc<Circle>, backend: Arc<Backend>, dbs: Vec<String>) {
    for db in &dbs {
        let measurements = match backend.get_measurements(db).await {
            Ok(m) => m,
            Err(e) => {
                warn!(url = %backend.url, db, error = %e, "listing measurements failed");
                continue;
            }
        };
        for measurement in measurements {
            let key = format!("{db},{measurement}");
            let target = match circle.route_url(&key) {
                Ok(t) => t,
                Err(e) => {
                    warn!(circle = circle.circle_num, key, error = %e, "routing failed");
                    continue;
                }
            };
            if target != backend.url {
                if let Err(e) = backend.drop_measurement(db, &measurement).await {
                    warn!(url = %backend.url, db, measurement, error = %e, "drop measurement failed");
                }
            }
        }
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("circles", &self.circles.len())
            .field("db_list", &self.db_list)
            .field("flush_size", &self.flush_size)
            .finish()
    }
}
