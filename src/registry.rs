use std::sync::LazyLock;

use dashmap::DashMap;

use crate::client::Client;
use crate::error::DbError;

// 全局单例（Rust 1.80+ 推荐）
pub static DB: LazyLock<ConnectionRegistry> = LazyLock::new(ConnectionRegistry::new);

/// 获取全局连接注册表
pub fn connections() -> &'static ConnectionRegistry {
    &DB
}

/// 数据库客户端注册表
///
/// Named clients, looked up by the model layer.
pub struct ConnectionRegistry {
    clients: DashMap<String, Client>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    /// 注册客户端，返回同名的旧客户端
    pub fn register(&self, client: Client) -> Option<Client> {
        self.clients.insert(client.name().to_string(), client)
    }

    /// 通过 URL 注册客户端，连接池在首次使用时创建
    pub fn register_url(&self, name: &str, url: &str) -> Result<Client, DbError> {
        let client = Client::from_url(name, url)?;
        self.register(client.clone());
        Ok(client)
    }

    pub fn get(&self, name: &str) -> Option<Client> {
        self.clients.get(name).map(|c| c.value().clone())
    }

    pub fn remove(&self, name: &str) -> Option<Client> {
        self.clients.remove(name).map(|(_, c)| c)
    }

    pub fn names(&self) -> Vec<String> {
        self.clients.iter().map(|e| e.key().clone()).collect()
    }

    /// Closes every registered pool; with `discard`, also forgets the clients.
    pub async fn close_all(&self, discard: bool) {
        // Never hold a shard lock across an await.
        let clients: Vec<Client> = self.clients.iter().map(|e| e.value().clone()).collect();
        for client in clients {
            client.close().await;
        }
        if discard {
            self.clients.clear();
        }
    }
}
