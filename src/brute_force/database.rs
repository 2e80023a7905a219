use super::BruteForcer;
use crate::{Result, ScanError};
use async_trait::async_trait;
use log::debug;
use mongodb::bson::doc;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::compat::TokioAsyncWriteCompatExt;

fn timed_out(operation: &str) -> ScanError {
    ScanError::Timeout {
        operation: operation.to_string(),
    }
}

// MySQL Brute Forcer
pub struct MysqlBruteForcer;

#[async_trait]
impl BruteForcer for MysqlBruteForcer {
    async fn attempt_login(
        &self,
        target: IpAddr,
        port: u16,
        username: &str,
        password: &str,
        connect_timeout: Duration,
    ) -> Result<bool> {
        use mysql_async::{Conn, OptsBuilder};

        let opts = OptsBuilder::default()
            .ip_or_hostname(target.to_string())
            .tcp_port(port)
            .prefer_socket(false)
            .user(Some(username))
            .pass(Some(password));

        match timeout(connect_timeout, Conn::new(opts)).await {
            Ok(Ok(conn)) => {
                let _ = conn.disconnect().await;
                Ok(true)
            }
            // Access denied and friends come back as server errors
            Ok(Err(mysql_async::Error::Server(e))) => {
                debug!("MySQL rejected {}: {}", username, e);
                Ok(false)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(timed_out("MySQL login")),
        }
    }

    fn service_name(&self) -> &'static str {
        "mysql"
    }

    fn default_port(&self) -> u16 {
        3306
    }
}

// PostgreSQL Brute Forcer
pub struct PostgresBruteForcer;

#[async_trait]
impl BruteForcer for PostgresBruteForcer {
    async fn attempt_login(
        &self,
        target: IpAddr,
        port: u16,
        username: &str,
        password: &str,
        connect_timeout: Duration,
    ) -> Result<bool> {
        use tokio_postgres::{Config, NoTls};

        let mut config = Config::new();
        config
            .host(&target.to_string())
            .port(port)
            .user(username)
            .password(password)
            .dbname("postgres")
            .connect_timeout(connect_timeout);

        match timeout(connect_timeout, config.connect(NoTls)).await {
            Ok(Ok((client, connection))) => {
                let connection_handle = tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        debug!("PostgreSQL connection error: {}", e);
                    }
                });
                drop(client);
                connection_handle.abort();
                Ok(true)
            }
            Ok(Err(e)) if e.as_db_error().is_some() => {
                debug!("PostgreSQL rejected {}: {}", username, e);
                Ok(false)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(timed_out("PostgreSQL login")),
        }
    }

    fn service_name(&self) -> &'static str {
        "postgresql"
    }

    fn default_port(&self) -> u16 {
        5432
    }
}

// SQL Server Brute Forcer
pub struct MssqlBruteForcer;

#[async_trait]
impl BruteForcer for MssqlBruteForcer {
    async fn attempt_login(
        &self,
        target: IpAddr,
        port: u16,
        username: &str,
        password: &str,
        connect_timeout: Duration,
    ) -> Result<bool> {
        use tiberius::{AuthMethod, Client, Config};

        let mut config = Config::new();
        config.host(target.to_string());
        config.port(port);
        config.database("master");
        config.authentication(AuthMethod::sql_server(username, password));
        config.trust_cert();

        let addr = SocketAddr::new(target, port);
        let tcp = timeout(connect_timeout, tokio::net::TcpStream::connect(addr))
            .await
            .map_err(|_| timed_out("SQL Server connect"))??;
        tcp.set_nodelay(true)?;

        match timeout(connect_timeout, Client::connect(config, tcp.compat_write())).await {
            Ok(Ok(client)) => {
                let _ = client.close().await;
                Ok(true)
            }
            Ok(Err(tiberius::error::Error::Server(e))) => {
                debug!("SQL Server rejected {}: {}", username, e);
                Ok(false)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(timed_out("SQL Server login")),
        }
    }

    fn service_name(&self) -> &'static str {
        "mssql"
    }

    fn default_port(&self) -> u16 {
        1433
    }
}

// MongoDB Brute Forcer
pub struct MongoDbBruteForcer;

#[async_trait]
impl BruteForcer for MongoDbBruteForcer {
    async fn attempt_login(
        &self,
        target: IpAddr,
        port: u16,
        username: &str,
        password: &str,
        connect_timeout: Duration,
    ) -> Result<bool> {
        use mongodb::error::ErrorKind;
        use mongodb::options::ClientOptions;
        use mongodb::Client;

        if username.is_empty() {
            return Ok(false);
        }

        let millis = connect_timeout.as_millis();
        let uri = format!(
            "mongodb://{}:{}@{}/?connectTimeoutMS={}&serverSelectionTimeoutMS={}",
            urlencoding::encode(username),
            urlencoding::encode(password),
            SocketAddr::new(target, port),
            millis,
            millis
        );

        let options = ClientOptions::parse(&uri).await?;
        let client = Client::with_options(options)?;
        let ping = timeout(
            connect_timeout,
            client.database("admin").run_command(doc! { "ping": 1 }, None),
        )
        .await
        .map_err(|_| timed_out("MongoDB login"))?;

        match ping {
            Ok(_) => Ok(true),
            Err(e) if matches!(*e.kind, ErrorKind::Authentication { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn service_name(&self) -> &'static str {
        "mongodb"
    }

    fn default_port(&self) -> u16 {
        27017
    }
}

// Redis Brute Forcer
pub struct RedisBruteForcer;

#[async_trait]
impl BruteForcer for RedisBruteForcer {
    async fn attempt_login(
        &self,
        target: IpAddr,
        port: u16,
        _username: &str,
        password: &str,
        connect_timeout: Duration,
    ) -> Result<bool> {
        let url = format!("redis://{}/0", SocketAddr::new(target, port));
        let client = redis::Client::open(url)?;
        let mut conn = timeout(connect_timeout, client.get_async_connection())
            .await
            .map_err(|_| timed_out("Redis connect"))??;

        // An empty password checks for an unauthenticated instance
        let command = if password.is_empty() {
            redis::cmd("PING")
        } else {
            let mut auth = redis::cmd("AUTH");
            auth.arg(password);
            auth
        };

        match timeout(connect_timeout, command.query_async::<_, String>(&mut conn)).await {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(e)) => {
                debug!("Redis rejected credentials: {}", e);
                Ok(false)
            }
            Err(_) => Err(timed_out("Redis auth")),
        }
    }

    fn service_name(&self) -> &'static str {
        "redis"
    }

    fn default_port(&self) -> u16 {
        6379
    }
}
