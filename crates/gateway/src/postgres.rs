//! sqlx-backed PostgreSQL gateway.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use rolesync_core::{Config, Error, Password, Result};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use tracing::{debug, info, instrument};

use crate::sql::{self, Ident, Literal};
use crate::{DatabaseGateway, RoleFilter, UserTransaction};

const LIST_ROLES: &str = "SELECT rolname FROM pg_roles WHERE NOT rolcanlogin ORDER BY rolname";

const LIST_USERS: &str = "SELECT rolname FROM pg_roles WHERE rolcanlogin ORDER BY rolname";

const LIST_MEMBERSHIPS: &str = "\
    SELECT member.rolname, grp.rolname \
    FROM pg_auth_members m \
    JOIN pg_roles grp ON grp.oid = m.roleid \
    JOIN pg_roles member ON member.oid = m.member \
    WHERE member.rolcanlogin";

const ROLE_EXISTS: &str = "SELECT EXISTS (SELECT 1 FROM pg_roles WHERE rolname = $1)";

/// SQLSTATE `duplicate_object`.
const DUPLICATE_OBJECT: &str = "42710";
/// SQLSTATE `undefined_object`.
const UNDEFINED_OBJECT: &str = "42704";

/// Connection and pool settings for [`PgGateway`].
#[derive(Debug, Clone)]
pub struct PgGatewayConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Password,
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub protected_roles: Vec<String>,
}

impl PgGatewayConfig {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.database.host.clone(),
            port: config.database.port,
            database: config.database.name.clone(),
            user: config.database.user.clone(),
            password: config.database.password.clone(),
            min_connections: config.pool.min_connections,
            max_connections: config.pool.max_connections,
            acquire_timeout: config.acquire_timeout(),
            protected_roles: config.protected_roles.clone(),
        }
    }
}

/// Gateway over a bounded sqlx pool.
///
/// The pool connects lazily; call [`PgGateway::ping`] (under a retry policy)
/// to wait for the server at startup.
pub struct PgGateway {
    pool: PgPool,
    admin: String,
    filter: RoleFilter,
    acquire_timeout: Duration,
}

impl PgGateway {
    /// Build the pool without connecting.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the pool bounds are unusable.
    pub fn new(config: &PgGatewayConfig) -> Result<Self> {
        if config.max_connections == 0 || config.min_connections > config.max_connections {
            return Err(Error::invalid_config(format!(
                "pool bounds {}..={} are invalid",
                config.min_connections, config.max_connections
            )));
        }

        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(config.password.expose())
            .database(&config.database)
            .application_name("rolesync");

        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_lazy_with(options);

        debug!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            max_connections = config.max_connections,
            "Created database connection pool"
        );

        Ok(Self {
            pool,
            admin: config.user.clone(),
            filter: RoleFilter::new(config.protected_roles.iter().cloned()).with(&config.user),
            acquire_timeout: config.acquire_timeout,
        })
    }

    /// Run a trivial query to check connectivity.
    ///
    /// # Errors
    ///
    /// Returns a transient error while the server is unreachable.
    #[instrument(skip(self))]
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, self.acquire_timeout))?;
        info!("Database connection established");
        Ok(())
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database connection pool closed");
    }

    async fn list_names(&self, query: &'static str) -> Result<BTreeSet<String>> {
        let names = sqlx::query_scalar::<_, String>(query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify(e, self.acquire_timeout))?;

        Ok(names
            .into_iter()
            .filter(|name| self.filter.is_managed(name))
            .collect())
    }
}

#[async_trait]
impl DatabaseGateway for PgGateway {
    #[instrument(skip(self))]
    async fn list_roles(&self) -> Result<BTreeSet<String>> {
        self.list_names(LIST_ROLES).await
    }

    #[instrument(skip(self))]
    async fn list_users(&self) -> Result<BTreeSet<String>> {
        self.list_names(LIST_USERS).await
    }

    #[instrument(skip(self))]
    async fn list_memberships(&self) -> Result<BTreeMap<String, BTreeSet<String>>> {
        let rows = sqlx::query_as::<_, (String, String)>(LIST_MEMBERSHIPS)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify(e, self.acquire_timeout))?;

        let mut memberships: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (member, role) in rows {
            if self.filter.is_managed(&member) && self.filter.is_managed(&role) {
                memberships.entry(member).or_default().insert(role);
            }
        }
        Ok(memberships)
    }

    #[instrument(skip(self))]
    async fn create_role(&self, name: &str) -> Result<()> {
        let statement = sql::create_role(Ident::new(name)?);
        match sqlx::raw_sql(&statement).execute(&self.pool).await {
            Ok(_) => Ok(()),
            Err(e) if sqlstate(&e).as_deref() == Some(DUPLICATE_OBJECT) => {
                debug!(role = %name, "Role already exists");
                Ok(())
            }
            Err(e) => Err(classify(e, self.acquire_timeout)),
        }
    }

    #[instrument(skip(self))]
    async fn drop_role(&self, name: &str) -> Result<()> {
        let statement = sql::drop_role(Ident::new(name)?);
        match sqlx::raw_sql(&statement).execute(&self.pool).await {
            Ok(_) => Ok(()),
            Err(e) if sqlstate(&e).as_deref() == Some(UNDEFINED_OBJECT) => Ok(()),
            Err(e) => Err(classify(e, self.acquire_timeout)),
        }
    }

    async fn begin(&self) -> Result<Box<dyn UserTransaction>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| classify(e, self.acquire_timeout))?;

        Ok(Box::new(PgUserTransaction {
            tx,
            admin: self.admin.clone(),
            acquire_timeout: self.acquire_timeout,
        }))
    }
}

/// One open transaction on a pooled connection.
struct PgUserTransaction {
    tx: Transaction<'static, Postgres>,
    admin: String,
    acquire_timeout: Duration,
}

impl PgUserTransaction {
    async fn run(&mut self, statement: &str) -> Result<()> {
        let conn: &mut PgConnection = &mut self.tx;
        sqlx::Executor::execute(conn, sqlx::raw_sql(statement))
            .await
            .map(|_| ())
            .map_err(|e| classify(e, self.acquire_timeout))
    }
}

#[async_trait]
impl UserTransaction for PgUserTransaction {
    #[instrument(skip(self, password))]
    async fn create_user(&mut self, name: &str, password: &Password) -> Result<()> {
        let statement = sql::create_user(Ident::new(name)?, Literal::password(name, password)?);
        self.run(&statement).await
    }

    #[instrument(skip(self, password))]
    async fn set_password(&mut self, name: &str, password: &Password) -> Result<()> {
        let statement = sql::set_password(Ident::new(name)?, Literal::password(name, password)?);
        self.run(&statement).await
    }

    #[instrument(skip(self))]
    async fn drop_user(&mut self, name: &str) -> Result<()> {
        let conn: &mut PgConnection = &mut self.tx;
        let exists = sqlx::query_scalar::<_, bool>(ROLE_EXISTS)
            .bind(name)
            .fetch_one(conn)
            .await
            .map_err(|e| classify(e, self.acquire_timeout))?;
        if !exists {
            debug!(user = %name, "User already gone");
            return Ok(());
        }

        let user = Ident::new(name)?;
        let admin = Ident::new(&self.admin)?;
        let statements = [
            sql::reassign_owned(user, admin),
            sql::drop_owned(user),
            sql::drop_role(user),
        ];
        for statement in &statements {
            self.run(statement).await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn grant_role(&mut self, user: &str, role: &str) -> Result<()> {
        let statement = sql::grant_role(Ident::new(role)?, Ident::new(user)?);
        self.run(&statement).await
    }

    #[instrument(skip(self))]
    async fn revoke_role(&mut self, user: &str, role: &str) -> Result<()> {
        let statement = sql::revoke_role(Ident::new(role)?, Ident::new(user)?);
        self.run(&statement).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let acquire_timeout = self.acquire_timeout;
        self.tx
            .commit()
            .await
            .map_err(|e| classify(e, acquire_timeout))
    }
}

fn sqlstate(error: &sqlx::Error) -> Option<String> {
    match error {
        sqlx::Error::Database(db) => db.code().map(|code| code.into_owned()),
        _ => None,
    }
}

/// Map a driver error onto the rolesync taxonomy.
fn classify(error: sqlx::Error, acquire_timeout: Duration) -> Error {
    match error {
        sqlx::Error::PoolTimedOut => Error::PoolExhausted {
            waited: acquire_timeout,
        },
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Protocol(_) => Error::database_unavailable(error.to_string()),
        sqlx::Error::Database(db) => {
            let message = db.message().to_string();
            match db.code() {
                Some(code) => classify_sqlstate(&code, message),
                None => Error::database("XX000", message),
            }
        }
        other => Error::database("XX000", other.to_string()),
    }
}

/// Map a SQLSTATE onto the rolesync taxonomy.
pub(crate) fn classify_sqlstate(code: &str, message: impl Into<String>) -> Error {
    let message = message.into();
    match code {
        "40001" | "40P01" => Error::serialization_conflict(code, message),
        "57P01" | "57P02" | "57P03" | "53300" => Error::database_unavailable(message),
        "42501" => Error::permission_denied(message),
        c if c.starts_with("08") => Error::database_unavailable(message),
        c if c.starts_with("23") => Error::constraint_violation(code, message),
        _ => Error::database(code, message),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use rolesync_core::ErrorKind;

    #[test]
    fn test_sqlstate_classification() {
        let cases = [
            ("40001", ErrorKind::SerializationConflict),
            ("40P01", ErrorKind::SerializationConflict),
            ("08006", ErrorKind::DatabaseUnavailable),
            ("57P01", ErrorKind::DatabaseUnavailable),
            ("53300", ErrorKind::DatabaseUnavailable),
            ("42501", ErrorKind::PermissionDenied),
            ("23505", ErrorKind::ConstraintViolation),
            ("2BP01", ErrorKind::Database),
        ];
        for (code, kind) in cases {
            assert_eq!(classify_sqlstate(code, "boom").kind(), kind, "{code}");
        }
    }

    #[test]
    fn test_transient_codes_are_retryable() {
        assert!(classify_sqlstate("40P01", "deadlock").is_transient());
        assert!(!classify_sqlstate("42501", "denied").is_transient());
    }

    #[test]
    fn test_pool_timeout_is_pool_exhausted() {
        let err = classify(sqlx::Error::PoolTimedOut, Duration::from_secs(3));
        assert_eq!(
            err,
            Error::PoolExhausted {
                waited: Duration::from_secs(3)
            }
        );
        assert!(classify(sqlx::Error::PoolClosed, Duration::ZERO).is_transient());
    }

    #[tokio::test]
    async fn test_new_rejects_bad_pool_bounds() {
        let config = PgGatewayConfig {
            min_connections: 4,
            max_connections: 2,
            ..PgGatewayConfig::from_config(&Config::default())
        };
        assert!(matches!(
            PgGateway::new(&config),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[tokio::test]
    async fn test_admin_login_is_protected() {
        let config = PgGatewayConfig {
            user: "rolesync_admin".to_string(),
            ..PgGatewayConfig::from_config(&Config::default())
        };
        let gateway = PgGateway::new(&config).unwrap();
        assert!(!gateway.filter.is_managed("rolesync_admin"));
        assert!(!gateway.filter.is_managed("postgres"));
        assert!(gateway.filter.is_managed("bob"));
    }
}
