use std::net::SocketAddr;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "false")]
    pub print_sink: bool,

    #[envconfig(default = "127.0.0.1:4000")]
    pub address: SocketAddr,

    #[envconfig(default = "redis://localhost:6379")]
    pub redis_url: String,

    pub database_url: String,
    #[envconfig(default = "10")]
    pub max_pg_connections: u32,

    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,
    #[envconfig(default = "events_raw")]
    pub kafka_topic: String,
    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,
}
