//! 用户实体与仓储接口
//!
//! 用户记录很小，持久化引擎不在本库范围内；这里只定义实体、仓储
//! 接口和一个内存实现，SQL实现由使用方按同一接口接入。

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::OtpGuardError;

/// 用户角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    /// 普通用户
    User,
    /// 管理员
    Admin,
}

/// 用户
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// 用户ID（由仓储分配）
    pub id: i64,
    /// 手机号
    pub phone_number: String,
    /// 显示名称
    pub name: String,
    /// 角色
    pub role: UserRole,
    /// 是否激活
    pub is_active: bool,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 更新时间
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// 创建普通用户
    pub fn new(phone_number: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            phone_number: phone_number.into(),
            name: name.into(),
            role: UserRole::User,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// 创建管理员用户
    pub fn new_admin(phone_number: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            role: UserRole::Admin,
            ..Self::new(phone_number, name)
        }
    }

    /// 更新最后活跃时间
    pub fn update_last_seen(&mut self) {
        self.updated_at = Utc::now();
    }

    /// 更新资料
    pub fn update_profile(&mut self, name: impl Into<String>, phone_number: impl Into<String>) {
        self.name = name.into();
        self.phone_number = phone_number.into();
        self.updated_at = Utc::now();
    }

    /// 是否是管理员
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }

    /// 停用
    pub fn deactivate(&mut self) {
        self.is_active = false;
        self.updated_at = Utc::now();
    }

    /// 激活
    pub fn activate(&mut self) {
        self.is_active = true;
        self.updated_at = Utc::now();
    }
}

/// 用户仓储接口
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// 创建用户并分配ID
    async fn create(&self, user: &mut User) -> Result<(), OtpGuardError>;

    /// 按ID查询
    async fn get_by_id(&self, id: i64) -> Result<Option<User>, OtpGuardError>;

    /// 按手机号查询
    async fn get_by_phone_number(&self, phone_number: &str)
        -> Result<Option<User>, OtpGuardError>;

    /// 更新用户
    async fn update(&self, user: &User) -> Result<(), OtpGuardError>;

    /// 删除用户
    async fn delete(&self, id: i64) -> Result<(), OtpGuardError>;
}

/// 内存用户仓储
pub struct MemoryUserRepository {
    users: dashmap::DashMap<i64, User>,
    next_id: AtomicI64,
}

impl MemoryUserRepository {
    /// 创建内存仓储
    pub fn new() -> Self {
        Self {
            users: dashmap::DashMap::new(),
            next_id: AtomicI64::new(1),
        }
    }
}

impl Default for MemoryUserRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserRepository for MemoryUserRepository {
    async fn create(&self, user: &mut User) -> Result<(), OtpGuardError> {
        let exists = self
            .users
            .iter()
            .any(|entry| entry.value().phone_number == user.phone_number);
        if exists {
            return Err(OtpGuardError::AlreadyExists(format!(
                "手机号已注册: {}",
                user.phone_number
            )));
        }

        user.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<User>, OtpGuardError> {
        Ok(self.users.get(&id).map(|entry| entry.value().clone()))
    }

    async fn get_by_phone_number(
        &self,
        phone_number: &str,
    ) -> Result<Option<User>, OtpGuardError> {
        Ok(self
            .users
            .iter()
            .find(|entry| entry.value().phone_number == phone_number)
            .map(|entry| entry.value().clone()))
    }

    async fn update(&self, user: &User) -> Result<(), OtpGuardError> {
        if !self.users.contains_key(&user.id) {
            return Err(OtpGuardError::NotFound(format!("用户不存在: {}", user.id)));
        }
        self.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<(), OtpGuardError> {
        if self.users.remove(&id).is_none() {
            return Err(OtpGuardError::NotFound(format!("用户不存在: {}", id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_assigns_id() {
        let repo = MemoryUserRepository::new();

        let mut user = User::new("+1234567890", "张三");
        repo.create(&mut user).await.unwrap();
        assert_eq!(user.id, 1);

        let mut other = User::new("+1987654321", "李四");
        repo.create(&mut other).await.unwrap();
        assert_eq!(other.id, 2);
    }

    #[tokio::test]
    async fn test_duplicate_phone_rejected() {
        let repo = MemoryUserRepository::new();

        let mut user = User::new("+1234567890", "张三");
        repo.create(&mut user).await.unwrap();

        let mut duplicate = User::new("+1234567890", "冒名者");
        let result = repo.create(&mut duplicate).await;
        assert!(matches!(result, Err(OtpGuardError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_lookup_and_update() {
        let repo = MemoryUserRepository::new();

        let mut user = User::new("+1234567890", "张三");
        repo.create(&mut user).await.unwrap();

        let found = repo.get_by_phone_number("+1234567890").await.unwrap();
        assert_eq!(found.unwrap().name, "张三");
        assert!(repo.get_by_phone_number("+0000").await.unwrap().is_none());

        user.update_profile("张三丰", "+1234567890");
        repo.update(&user).await.unwrap();
        let found = repo.get_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(found.name, "张三丰");
    }

    #[tokio::test]
    async fn test_update_missing_user() {
        let repo = MemoryUserRepository::new();
        let user = User::new("+1234567890", "张三");
        assert!(matches!(
            repo.update(&user).await,
            Err(OtpGuardError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete() {
        let repo = MemoryUserRepository::new();

        let mut user = User::new("+1234567890", "张三");
        repo.create(&mut user).await.unwrap();

        repo.delete(user.id).await.unwrap();
        assert!(repo.get_by_id(user.id).await.unwrap().is_none());
        assert!(matches!(
            repo.delete(user.id).await,
            Err(OtpGuardError::NotFound(_))
        ));
    }

    #[test]
    fn test_user_roles_and_lifecycle() {
        let mut user = User::new("+1234567890", "张三");
        assert!(!user.is_admin());
        assert!(user.is_active);

        let admin = User::new_admin("+1987654321", "管理员");
        assert!(admin.is_admin());

        user.deactivate();
        assert!(!user.is_active);
        user.activate();
        assert!(user.is_active);
    }
}
