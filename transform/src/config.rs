use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,
    #[envconfig(default = "events_raw")]
    pub kafka_topic: String,
    #[envconfig(default = "analytics-transform")]
    pub kafka_group_id: String,

    #[envconfig(default = "http://localhost:8123")]
    pub clickhouse_url: String,
    #[envconfig(default = "default")]
    pub clickhouse_user: String,
    #[envconfig(default = "")]
    pub clickhouse_password: String,
    #[envconfig(default = "analytics")]
    pub clickhouse_database: String,
}
