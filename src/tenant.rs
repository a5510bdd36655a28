use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::config::Config;
use crate::engine::Engine;
use crate::gateway::ManualGateway;
use crate::limits::*;
use crate::notify::{NotificationConfig, NotifyHub};
use crate::reaper;
use crate::refund::TieredRefundPolicy;

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL +
/// reminder and compaction tasks. Tenant = database name from the pgwire
/// connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    notifications: NotificationConfig,
    refunds: TieredRefundPolicy,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            notifications: NotificationConfig::default(),
            refunds: TieredRefundPolicy::default(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            notifications: config.notifications.clone(),
            refunds: config.refunds.clone(),
            ..Self::new(config.data_dir.clone(), config.compact_threshold)
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Keep the WAL inside data_dir.
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        // Two first connections may race here; the entry API keeps one engine.
        let entry = match self.engines.entry(tenant.to_string()) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(vacant) => vacant,
        };

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let notify = Arc::new(NotifyHub::new(self.notifications.clone()));
        let engine = Arc::new(Engine::with_collaborators(
            wal_path,
            notify,
            Arc::new(ManualGateway),
            Arc::new(self.refunds.clone()),
        )?);

        tokio::spawn(reaper::run_reminders(engine.clone(), reaper::REMINDER_INTERVAL));
        tokio::spawn(reaper::run_compactor(engine.clone(), self.compact_threshold));

        entry.insert(engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!(tenant, "tenant loaded");
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BookingRequest;
    use crate::model::*;
    use chrono::{NaiveDate, NaiveTime};
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = TenantManager::new(dir, 1000);

        let eng_a = tm.get_or_create("tenant_a").unwrap();
        let eng_b = tm.get_or_create("tenant_b").unwrap();

        // Same service id in both tenants, a window only in A.
        let sid = Ulid::new();
        eng_a.create_service(Service::new(sid, "Yoga", 2000, 60)).await.unwrap();
        eng_b.create_service(Service::new(sid, "Yoga", 2000, 60)).await.unwrap();
        eng_a
            .add_window(AvailabilityWindow::new(
                Ulid::new(),
                sid,
                WindowKind::Regular,
                WindowPattern::Daily,
                NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            ))
            .await
            .unwrap();

        let day = NaiveDate::from_ymd_opt(2031, 1, 7).unwrap();
        let slots_a = eng_a.available_slots(sid, None, day, day, &[]).await.unwrap();
        let slots_b = eng_b.available_slots(sid, None, day, day, &[]).await.unwrap();
        assert_eq!(slots_a.len(), 1);
        assert!(slots_b.is_empty());

        let start = slots_a[0].span.start;
        eng_a
            .create_booking(BookingRequest {
                id: Ulid::new(),
                user_id: Ulid::new(),
                service_id: sid,
                location_id: None,
                package_id: None,
                window_id: None,
                scheduled_at: start,
                addons: Vec::new(),
                client: ClientDetails::default(),
            })
            .await
            .unwrap();
        assert!(eng_b.list_bookings(None, None).await.is_empty());
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = TenantManager::new(dir.clone(), 1000);

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = TenantManager::new(dir, 1000);

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = TenantManager::new(dir.clone(), 1000);

        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());

        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = TenantManager::new(dir, 1000);

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let dir = test_data_dir("count_limit");
        let tm = TenantManager::new(dir, 1000);

        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }

    #[tokio::test]
    async fn config_reaches_each_tenant() {
        let config = Config {
            data_dir: test_data_dir("from_config"),
            notifications: NotificationConfig {
                reminder_lead_ms: 2 * HOUR_MS,
                subject_prefix: Some("Studio".into()),
            },
            ..Config::default()
        };
        let tm = TenantManager::from_config(&config);
        let engine = tm.get_or_create("studio").unwrap();
        assert_eq!(engine.notify.config().reminder_lead_ms, 2 * HOUR_MS);
    }
}
