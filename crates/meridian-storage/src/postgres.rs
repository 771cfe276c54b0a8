//! Postgres-backed [`StoreGateway`].
//!
//! Holds a writable pool bound to the primary and an optional read-only pool
//! bound to a replica. Reads prefer the replica and fall back to the primary
//! on error; writes always target the primary. If the primary pool cannot
//! serve a write, the error becomes [`StoreError::Unavailable`] — there is no
//! configuration knob to route writes to a replica instead (see
//! `DESIGN.md`).

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::warn;

use crate::model::{
    Application, ClusterNode, Event, Instance, LeaderLease, MetricSample, NewEvent, ScalingPolicy,
};
use crate::{EventFilter, InstanceFilter, MetricFilter, StoreError, StoreGateway};

/// Store gateway backed by one or two Postgres pools.
pub struct PostgresStore {
    primary: PgPool,
    replica: Option<PgPool>,
}

impl PostgresStore {
    /// Connect to the primary (and, if given, a replica) and run migrations
    /// against the primary.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if either connection or the
    /// migration run fails.
    pub async fn connect(primary_url: &str, replica_url: Option<&str>) -> Result<Self, StoreError> {
        let primary = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(30))
            .connect(primary_url)
            .await
            .map_err(|e| StoreError::unavailable(format!("connect primary: {e}")))?;

        sqlx::migrate!("./migrations")
            .run(&primary)
            .await
            .map_err(|e| StoreError::unavailable(format!("migrate: {e}")))?;

        let replica = match replica_url {
            Some(url) => Some(
                PgPoolOptions::new()
                    .max_connections(20)
                    .acquire_timeout(Duration::from_secs(30))
                    .connect(url)
                    .await
                    .map_err(|e| StoreError::unavailable(format!("connect replica: {e}")))?,
            ),
            None => None,
        };

        Ok(Self { primary, replica })
    }

    /// Run a read against the replica (if configured), falling back to the
    /// primary if the replica errors.
    async fn run_read<T, F, Fut>(&self, f: F) -> Result<T, StoreError>
    where
        F: Fn(PgPool) -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        if let Some(replica) = &self.replica {
            match f(replica.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(error = %e, "replica read failed, falling back to primary");
                }
            }
        }
        f(self.primary.clone()).await.map_err(StoreError::from)
    }
}

fn row_to_application(row: &sqlx::postgres::PgRow) -> Result<Application, StoreError> {
    let status: String = row.try_get("status")?;
    let mode: String = row.try_get("mode")?;
    Ok(Application {
        name: row.try_get("name")?,
        spec: row.try_get("spec")?,
        status: status.parse().map_err(StoreError::invalid)?,
        desired_replicas: u32::try_from(row.try_get::<i32, _>("desired_replicas")?).unwrap_or(0),
        current_replicas: u32::try_from(row.try_get::<i32, _>("current_replicas")?).unwrap_or(0),
        mode: mode.parse().map_err(StoreError::invalid)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_scaled_at: row.try_get("last_scaled_at")?,
    })
}

fn row_to_instance(row: &sqlx::postgres::PgRow) -> Result<Instance, StoreError> {
    let status: String = row.try_get("status")?;
    let health_status: String = row.try_get("health_status")?;
    Ok(Instance {
        container_id: row.try_get("container_id")?,
        app_name: row.try_get("app_name")?,
        replica_index: u32::try_from(row.try_get::<i32, _>("replica_index")?).unwrap_or(0),
        ip: row.try_get("ip")?,
        port: u16::try_from(row.try_get::<i32, _>("port")?).unwrap_or(0),
        status: status.parse().map_err(StoreError::invalid)?,
        health_status: health_status.parse().map_err(StoreError::invalid)?,
        consecutive_failures: u32::try_from(row.try_get::<i32, _>("consecutive_failures")?)
            .unwrap_or(0),
        consecutive_successes: u32::try_from(row.try_get::<i32, _>("consecutive_successes")?)
            .unwrap_or(0),
        failure_count: u32::try_from(row.try_get::<i32, _>("failure_count")?).unwrap_or(0),
        last_health_check: row.try_get("last_health_check")?,
    })
}

fn row_to_scaling_policy(row: &sqlx::postgres::PgRow) -> Result<ScalingPolicy, StoreError> {
    Ok(ScalingPolicy {
        app_name: row.try_get("app_name")?,
        min_replicas: u32::try_from(row.try_get::<i32, _>("min_replicas")?).unwrap_or(0),
        max_replicas: u32::try_from(row.try_get::<i32, _>("max_replicas")?).unwrap_or(0),
        target_rps_per_replica: row.try_get("target_rps_per_replica")?,
        max_p95_latency_ms: row.try_get("max_p95_latency_ms")?,
        max_cpu_percent: row.try_get("max_cpu_percent")?,
        max_memory_percent: row.try_get("max_memory_percent")?,
        max_conn_per_replica: row.try_get("max_conn_per_replica")?,
        scale_out_threshold_pct: u8::try_from(row.try_get::<i16, _>("scale_out_threshold_pct")?)
            .unwrap_or(100),
        scale_in_threshold_pct: u8::try_from(row.try_get::<i16, _>("scale_in_threshold_pct")?)
            .unwrap_or(0),
        evaluation_window_seconds: u32::try_from(
            row.try_get::<i32, _>("evaluation_window_seconds")?,
        )
        .unwrap_or(60),
        cooldown_seconds: u32::try_from(row.try_get::<i32, _>("cooldown_seconds")?).unwrap_or(60),
        stabilization_window_seconds: u32::try_from(
            row.try_get::<i32, _>("stabilization_window_seconds")?,
        )
        .unwrap_or(60),
        max_scale_out_step: u32::try_from(row.try_get::<i32, _>("max_scale_out_step")?)
            .unwrap_or(0),
        max_scale_in_step: u32::try_from(row.try_get::<i32, _>("max_scale_in_step")?).unwrap_or(1),
    })
}

fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<Event, StoreError> {
    let severity: String = row.try_get("severity")?;
    Ok(Event {
        id: row.try_get("id")?,
        app_name: row.try_get("app_name")?,
        container_id: row.try_get("container_id")?,
        event_type: row.try_get("event_type")?,
        severity: severity.parse().map_err(StoreError::invalid)?,
        message: row.try_get("message")?,
        details: row.try_get("details")?,
        timestamp: row.try_get("timestamp")?,
    })
}

fn row_to_metric(row: &sqlx::postgres::PgRow) -> Result<MetricSample, StoreError> {
    let metric_type: String = row.try_get("metric_type")?;
    Ok(MetricSample {
        app_name: row.try_get("app_name")?,
        metric_type: metric_type.parse().map_err(StoreError::invalid)?,
        timestamp: row.try_get("timestamp")?,
        value: row.try_get("value")?,
        labels: row.try_get("labels")?,
    })
}

fn row_to_node(row: &sqlx::postgres::PgRow) -> Result<ClusterNode, StoreError> {
    let state: String = row.try_get("state")?;
    Ok(ClusterNode {
        node_id: row.try_get("node_id")?,
        hostname: row.try_get("hostname")?,
        api_url: row.try_get("api_url")?,
        state: state.parse().map_err(StoreError::invalid)?,
        term: row.try_get("term")?,
        last_heartbeat: row.try_get("last_heartbeat")?,
        is_healthy: row.try_get("is_healthy")?,
    })
}

fn row_to_lease(row: &sqlx::postgres::PgRow) -> Result<LeaderLease, StoreError> {
    Ok(LeaderLease {
        leader_id: row.try_get("leader_id")?,
        term: row.try_get("term")?,
        acquired_at: row.try_get("acquired_at")?,
        expires_at: row.try_get("expires_at")?,
        renewed_at: row.try_get("renewed_at")?,
        hostname: row.try_get("hostname")?,
        api_url: row.try_get("api_url")?,
    })
}

#[async_trait]
impl StoreGateway for PostgresStore {
    async fn upsert_application(&self, app: &Application) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO applications
                (name, spec, status, desired_replicas, current_replicas, mode, created_at, updated_at, last_scaled_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (name) DO UPDATE SET
                spec = EXCLUDED.spec,
                status = EXCLUDED.status,
                desired_replicas = EXCLUDED.desired_replicas,
                current_replicas = EXCLUDED.current_replicas,
                mode = EXCLUDED.mode,
                updated_at = EXCLUDED.updated_at,
                last_scaled_at = EXCLUDED.last_scaled_at
            ",
        )
        .bind(&app.name)
        .bind(&app.spec)
        .bind(app.status.to_string())
        .bind(i32::try_from(app.desired_replicas).unwrap_or(i32::MAX))
        .bind(i32::try_from(app.current_replicas).unwrap_or(i32::MAX))
        .bind(app.mode.to_string())
        .bind(app.created_at)
        .bind(app.updated_at)
        .bind(app.last_scaled_at)
        .execute(&self.primary)
        .await?;
        Ok(())
    }

    async fn get_application(&self, name: &str) -> Result<Option<Application>, StoreError> {
        let name = name.to_owned();
        self.run_read(move |pool| {
            let name = name.clone();
            async move {
                sqlx::query("SELECT * FROM applications WHERE name = $1")
                    .bind(&name)
                    .fetch_optional(&pool)
                    .await
            }
        })
        .await?
        .map(|row| row_to_application(&row))
        .transpose()
    }

    async fn list_applications(&self) -> Result<Vec<Application>, StoreError> {
        let rows = self
            .run_read(|pool| async move {
                sqlx::query("SELECT * FROM applications ORDER BY name")
                    .fetch_all(&pool)
                    .await
            })
            .await?;
        rows.iter().map(row_to_application).collect()
    }

    async fn delete_application(&self, name: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM applications WHERE name = $1")
            .bind(name)
            .execute(&self.primary)
            .await?;
        Ok(())
    }

    async fn upsert_instance(&self, instance: &Instance) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO instances
                (container_id, app_name, replica_index, ip, port, status, health_status,
                 consecutive_failures, consecutive_successes, failure_count, last_health_check)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (container_id) DO UPDATE SET
                ip = EXCLUDED.ip,
                port = EXCLUDED.port,
                status = EXCLUDED.status,
                health_status = EXCLUDED.health_status,
                consecutive_failures = EXCLUDED.consecutive_failures,
                consecutive_successes = EXCLUDED.consecutive_successes,
                failure_count = EXCLUDED.failure_count,
                last_health_check = EXCLUDED.last_health_check
            ",
        )
        .bind(&instance.container_id)
        .bind(&instance.app_name)
        .bind(i32::try_from(instance.replica_index).unwrap_or(i32::MAX))
        .bind(&instance.ip)
        .bind(i32::from(instance.port))
        .bind(instance.status.to_string())
        .bind(instance.health_status.to_string())
        .bind(i32::try_from(instance.consecutive_failures).unwrap_or(i32::MAX))
        .bind(i32::try_from(instance.consecutive_successes).unwrap_or(i32::MAX))
        .bind(i32::try_from(instance.failure_count).unwrap_or(i32::MAX))
        .bind(instance.last_health_check)
        .execute(&self.primary)
        .await?;
        Ok(())
    }

    async fn get_instance(&self, container_id: &str) -> Result<Option<Instance>, StoreError> {
        let container_id = container_id.to_owned();
        self.run_read(move |pool| {
            let container_id = container_id.clone();
            async move {
                sqlx::query("SELECT * FROM instances WHERE container_id = $1")
                    .bind(&container_id)
                    .fetch_optional(&pool)
                    .await
            }
        })
        .await?
        .map(|row| row_to_instance(&row))
        .transpose()
    }

    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<Instance>, StoreError> {
        let app_name = filter.app_name.clone();
        let status = filter.status.map(|s| s.to_string());
        let rows = self
            .run_read(move |pool| {
                let app_name = app_name.clone();
                let status = status.clone();
                async move {
                    sqlx::query(
                        r"
                        SELECT * FROM instances
                        WHERE ($1::text IS NULL OR app_name = $1)
                          AND ($2::text IS NULL OR status = $2)
                        ORDER BY app_name, replica_index
                        ",
                    )
                    .bind(app_name)
                    .bind(status)
                    .fetch_all(&pool)
                    .await
                }
            })
            .await?;
        rows.iter().map(row_to_instance).collect()
    }

    async fn delete_instance(&self, container_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM instances WHERE container_id = $1")
            .bind(container_id)
            .execute(&self.primary)
            .await?;
        Ok(())
    }

    async fn upsert_scaling_policy(&self, policy: &ScalingPolicy) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO scaling_policies
                (app_name, min_replicas, max_replicas, target_rps_per_replica, max_p95_latency_ms,
                 max_cpu_percent, max_memory_percent, max_conn_per_replica, scale_out_threshold_pct,
                 scale_in_threshold_pct, evaluation_window_seconds, cooldown_seconds,
                 stabilization_window_seconds, max_scale_out_step, max_scale_in_step)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)
            ON CONFLICT (app_name) DO UPDATE SET
                min_replicas = EXCLUDED.min_replicas,
                max_replicas = EXCLUDED.max_replicas,
                target_rps_per_replica = EXCLUDED.target_rps_per_replica,
                max_p95_latency_ms = EXCLUDED.max_p95_latency_ms,
                max_cpu_percent = EXCLUDED.max_cpu_percent,
                max_memory_percent = EXCLUDED.max_memory_percent,
                max_conn_per_replica = EXCLUDED.max_conn_per_replica,
                scale_out_threshold_pct = EXCLUDED.scale_out_threshold_pct,
                scale_in_threshold_pct = EXCLUDED.scale_in_threshold_pct,
                evaluation_window_seconds = EXCLUDED.evaluation_window_seconds,
                cooldown_seconds = EXCLUDED.cooldown_seconds,
                stabilization_window_seconds = EXCLUDED.stabilization_window_seconds,
                max_scale_out_step = EXCLUDED.max_scale_out_step,
                max_scale_in_step = EXCLUDED.max_scale_in_step
            ",
        )
        .bind(&policy.app_name)
        .bind(i32::try_from(policy.min_replicas).unwrap_or(0))
        .bind(i32::try_from(policy.max_replicas).unwrap_or(i32::MAX))
        .bind(policy.target_rps_per_replica)
        .bind(policy.max_p95_latency_ms)
        .bind(policy.max_cpu_percent)
        .bind(policy.max_memory_percent)
        .bind(policy.max_conn_per_replica)
        .bind(i16::from(policy.scale_out_threshold_pct))
        .bind(i16::from(policy.scale_in_threshold_pct))
        .bind(i32::try_from(policy.evaluation_window_seconds).unwrap_or(i32::MAX))
        .bind(i32::try_from(policy.cooldown_seconds).unwrap_or(i32::MAX))
        .bind(i32::try_from(policy.stabilization_window_seconds).unwrap_or(i32::MAX))
        .bind(i32::try_from(policy.max_scale_out_step).unwrap_or(i32::MAX))
        .bind(i32::try_from(policy.max_scale_in_step).unwrap_or(i32::MAX))
        .execute(&self.primary)
        .await?;
        Ok(())
    }

    async fn get_scaling_policy(
        &self,
        app_name: &str,
    ) -> Result<Option<ScalingPolicy>, StoreError> {
        let app_name = app_name.to_owned();
        self.run_read(move |pool| {
            let app_name = app_name.clone();
            async move {
                sqlx::query("SELECT * FROM scaling_policies WHERE app_name = $1")
                    .bind(&app_name)
                    .fetch_optional(&pool)
                    .await
            }
        })
        .await?
        .map(|row| row_to_scaling_policy(&row))
        .transpose()
    }

    async fn append_event(&self, event: NewEvent) -> Result<Event, StoreError> {
        let row = sqlx::query(
            r"
            INSERT INTO events (app_name, container_id, event_type, severity, message, details)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            ",
        )
        .bind(&event.app_name)
        .bind(&event.container_id)
        .bind(&event.event_type)
        .bind(event.severity.to_string())
        .bind(&event.message)
        .bind(&event.details)
        .fetch_one(&self.primary)
        .await?;
        row_to_event(&row)
    }

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<Event>, StoreError> {
        let app_name = filter.app_name.clone();
        let since = filter.since;
        let limit = filter.limit.unwrap_or(200);
        let rows = self
            .run_read(move |pool| {
                let app_name = app_name.clone();
                async move {
                    sqlx::query(
                        r"
                        SELECT * FROM events
                        WHERE ($1::text IS NULL OR app_name = $1)
                          AND ($2::timestamptz IS NULL OR timestamp >= $2)
                        ORDER BY timestamp DESC
                        LIMIT $3
                        ",
                    )
                    .bind(app_name)
                    .bind(since)
                    .bind(limit)
                    .fetch_all(&pool)
                    .await
                }
            })
            .await?;
        rows.iter().map(row_to_event).collect()
    }

    async fn prune_events_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM events WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&self.primary)
            .await?;
        Ok(result.rows_affected())
    }

    async fn record_metric(&self, sample: MetricSample) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO metrics (app_name, metric_type, timestamp, value, labels) VALUES ($1,$2,$3,$4,$5)",
        )
        .bind(&sample.app_name)
        .bind(sample.metric_type.to_string())
        .bind(sample.timestamp)
        .bind(sample.value)
        .bind(&sample.labels)
        .execute(&self.primary)
        .await?;
        Ok(())
    }

    async fn list_metrics(&self, filter: &MetricFilter) -> Result<Vec<MetricSample>, StoreError> {
        let app_name = filter.app_name.clone();
        let metric_type = filter.metric_type.to_string();
        let since = filter.since;
        let rows = self
            .run_read(move |pool| {
                let app_name = app_name.clone();
                let metric_type = metric_type.clone();
                async move {
                    sqlx::query(
                        r"
                        SELECT * FROM metrics
                        WHERE app_name = $1 AND metric_type = $2 AND timestamp >= $3
                        ORDER BY timestamp ASC
                        ",
                    )
                    .bind(app_name)
                    .bind(metric_type)
                    .bind(since)
                    .fetch_all(&pool)
                    .await
                }
            })
            .await?;
        rows.iter().map(row_to_metric).collect()
    }

    async fn prune_metrics_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM metrics WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&self.primary)
            .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_node(&self, node: &ClusterNode) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO cluster_nodes (node_id, hostname, api_url, state, term, last_heartbeat, is_healthy)
            VALUES ($1,$2,$3,$4,$5,$6,$7)
            ON CONFLICT (node_id) DO UPDATE SET
                hostname = EXCLUDED.hostname,
                api_url = EXCLUDED.api_url,
                state = EXCLUDED.state,
                term = EXCLUDED.term,
                last_heartbeat = EXCLUDED.last_heartbeat,
                is_healthy = EXCLUDED.is_healthy
            ",
        )
        .bind(&node.node_id)
        .bind(&node.hostname)
        .bind(&node.api_url)
        .bind(node.state.to_string())
        .bind(node.term)
        .bind(node.last_heartbeat)
        .bind(node.is_healthy)
        .execute(&self.primary)
        .await?;
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<ClusterNode>, StoreError> {
        let rows = self
            .run_read(|pool| async move {
                sqlx::query("SELECT * FROM cluster_nodes ORDER BY node_id")
                    .fetch_all(&pool)
                    .await
            })
            .await?;
        rows.iter().map(row_to_node).collect()
    }

    async fn try_acquire_lease(
        &self,
        node_id: &str,
        term: i64,
        hostname: &str,
        api_url: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(30);
        let row = sqlx::query(
            r"
            INSERT INTO leader_lease (id, leader_id, term, acquired_at, expires_at, renewed_at, hostname, api_url)
            VALUES (1, $1, $2, now(), now() + make_interval(secs => $3), now(), $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                leader_id = EXCLUDED.leader_id,
                term = EXCLUDED.term,
                acquired_at = now(),
                expires_at = now() + make_interval(secs => $3),
                renewed_at = now(),
                hostname = EXCLUDED.hostname,
                api_url = EXCLUDED.api_url
            WHERE leader_lease.expires_at <= now() OR leader_lease.term < EXCLUDED.term
            RETURNING leader_id
            ",
        )
        .bind(node_id)
        .bind(term)
        .bind(ttl_secs as f64)
        .bind(hostname)
        .bind(api_url)
        .fetch_optional(&self.primary)
        .await?;

        Ok(row.is_some())
    }

    async fn renew_lease(
        &self,
        node_id: &str,
        term: i64,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(30) as f64;
        let result = sqlx::query(
            r"
            UPDATE leader_lease
            SET expires_at = now() + make_interval(secs => $3), renewed_at = now()
            WHERE id = 1 AND leader_id = $1 AND term = $2
            ",
        )
        .bind(node_id)
        .bind(term)
        .bind(ttl_secs)
        .execute(&self.primary)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn read_lease(&self) -> Result<Option<LeaderLease>, StoreError> {
        let row = self
            .run_read(|pool| async move {
                sqlx::query("SELECT * FROM leader_lease WHERE id = 1")
                    .fetch_optional(&pool)
                    .await
            })
            .await?;
        row.map(|r| row_to_lease(&r)).transpose()
    }

    async fn release_lease(&self, node_id: &str, term: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE leader_lease SET expires_at = now() WHERE id = 1 AND leader_id = $1 AND term = $2",
        )
        .bind(node_id)
        .bind(term)
        .execute(&self.primary)
        .await?;
        Ok(())
    }
}
