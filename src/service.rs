//! User service contract.
//!
//! | Operation            | Wire name          | Args                                 | Returns     | Declared       |
//! |----------------------|--------------------|--------------------------------------|-------------|----------------|
//! | `create_user`        | `createUser`       | 1 name, 2 age                        | `User`      | -              |
//! | `get_user`           | `getUser`          | 1 user_id                            | `User`      | `UserNotFound` |
//! | `get_all_users`      | `getAllUsers`      | -                                    | `Vec<User>` | -              |
//! | `update_user`        | `updateUser`       | 1 user                               | `User`      | `UserNotFound` |
//! | `delete_user`        | `deleteUser`       | 1 user_id                            | -           | `UserNotFound` |
//! | `validate_user_data` | `validateUserData` | 1 name (optional), 2 age, 3 is_active | `String`   | -              |
//! | `log_user_activity`  | `logUserActivity`  | 1 action, 2 user_id, 3 timestamp     | oneway      | -              |
//!
//! [`UserServiceClient`] is the caller side, [`UserService`] the handler
//! side (served by [`crate::server`]), and [`InMemoryUserService`] a
//! ready-made handler keeping users in memory.
//!
//! # Example
//!
//! ```no_run
//! use wirecall::{ClientConfig, UserServiceClient};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::from_env_and_args(std::env::args().skip(1));
//! let mut users = UserServiceClient::connect(&config).await?;
//!
//! let alice = users.create_user("Alice", 30).await?;
//! match users.get_user(alice.id + 100).await {
//!     Ok(user) => println!("found {}", user.name),
//!     Err(e) => match e.declared() {
//!         Some(not_found) => println!("{}", not_found.message),
//!         None => return Err(e.into()),
//!     },
//! }
//! users.log_user_activity("login", alice.id, "2024-01-01T00:00:00Z").await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::client::{Reply, RpcClient, VoidReply};
use crate::config::ClientConfig;
use crate::envelope::{ApplicationErrorKind, ApplicationException};
use crate::error::{CallError, Result, WirecallError};
use crate::protocol::{
    read_field, read_struct, required, skip, write_field, write_optional_field, InputProtocol,
    OutputProtocol, TType, WireValue,
};

/// Wire names of the operations.
pub mod method {
    pub const CREATE_USER: &str = "createUser";
    pub const GET_USER: &str = "getUser";
    pub const GET_ALL_USERS: &str = "getAllUsers";
    pub const UPDATE_USER: &str = "updateUser";
    pub const DELETE_USER: &str = "deleteUser";
    pub const VALIDATE_USER_DATA: &str = "validateUserData";
    pub const LOG_USER_ACTIVITY: &str = "logUserActivity";
}

/// A stored user. `id` is assigned by the service and never changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub age: i32,
}

impl WireValue for User {
    const TTYPE: TType = TType::Struct;

    fn write_value(&self, out: &mut dyn OutputProtocol) -> Result<()> {
        out.write_struct_begin("User")?;
        write_field(out, 1, &self.id)?;
        write_field(out, 2, &self.name)?;
        write_field(out, 3, &self.age)?;
        out.write_field_stop()?;
        out.write_struct_end()
    }

    fn read_value(input: &mut dyn InputProtocol) -> Result<Self> {
        let (mut id, mut name, mut age) = (None, None, None);
        read_struct(input, |input, field| {
            match field.id {
                1 => id = read_field(input, field)?,
                2 => name = read_field(input, field)?,
                3 => age = read_field(input, field)?,
                _ => skip(input, field.ttype)?,
            }
            Ok(())
        })?;
        Ok(User {
            id: required(id, "User", "id")?,
            name: required(name, "User", "name")?,
            age: required(age, "User", "age")?,
        })
    }
}

/// Declared exception: no user with the requested id.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct UserNotFound {
    pub message: String,
}

impl UserNotFound {
    pub fn for_id(user_id: i64) -> Self {
        Self {
            message: format!("User with ID {} not found", user_id),
        }
    }
}

impl WireValue for UserNotFound {
    const TTYPE: TType = TType::Struct;

    fn write_value(&self, out: &mut dyn OutputProtocol) -> Result<()> {
        out.write_struct_begin("UserNotFoundException")?;
        write_field(out, 1, &self.message)?;
        out.write_field_stop()?;
        out.write_struct_end()
    }

    fn read_value(input: &mut dyn InputProtocol) -> Result<Self> {
        let mut message = None;
        read_struct(input, |input, field| {
            match field.id {
                1 => message = read_field(input, field)?,
                _ => skip(input, field.ttype)?,
            }
            Ok(())
        })?;
        let message: String = required(message, "UserNotFoundException", "message")?;
        if message.is_empty() {
            return Err(WirecallError::decode("UserNotFoundException.message is empty"));
        }
        Ok(UserNotFound { message })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateUserArgs {
    pub name: String,
    pub age: i32,
}

impl WireValue for CreateUserArgs {
    const TTYPE: TType = TType::Struct;

    fn write_value(&self, out: &mut dyn OutputProtocol) -> Result<()> {
        out.write_struct_begin("createUser_args")?;
        write_field(out, 1, &self.name)?;
        write_field(out, 2, &self.age)?;
        out.write_field_stop()?;
        out.write_struct_end()
    }

    fn read_value(input: &mut dyn InputProtocol) -> Result<Self> {
        let (mut name, mut age) = (None, None);
        read_struct(input, |input, field| {
            match field.id {
                1 => name = read_field(input, field)?,
                2 => age = read_field(input, field)?,
                _ => skip(input, field.ttype)?,
            }
            Ok(())
        })?;
        Ok(CreateUserArgs {
            name: required(name, "createUser_args", "name")?,
            age: required(age, "createUser_args", "age")?,
        })
    }
}

/// Arguments of `getUser` and `deleteUser`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserIdArgs {
    pub user_id: i64,
}

/// Arguments of `getUser`.
pub type GetUserArgs = UserIdArgs;

/// Arguments of `deleteUser`.
pub type DeleteUserArgs = UserIdArgs;

impl WireValue for UserIdArgs {
    const TTYPE: TType = TType::Struct;

    fn write_value(&self, out: &mut dyn OutputProtocol) -> Result<()> {
        out.write_struct_begin("userId_args")?;
        write_field(out, 1, &self.user_id)?;
        out.write_field_stop()?;
        out.write_struct_end()
    }

    fn read_value(input: &mut dyn InputProtocol) -> Result<Self> {
        let mut user_id = None;
        read_struct(input, |input, field| {
            match field.id {
                1 => user_id = read_field(input, field)?,
                _ => skip(input, field.ttype)?,
            }
            Ok(())
        })?;
        Ok(UserIdArgs {
            user_id: required(user_id, "userId_args", "userId")?,
        })
    }
}

/// Arguments of `getAllUsers` (none).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetAllUsersArgs;

impl WireValue for GetAllUsersArgs {
    const TTYPE: TType = TType::Struct;

    fn write_value(&self, out: &mut dyn OutputProtocol) -> Result<()> {
        out.write_struct_begin("getAllUsers_args")?;
        out.write_field_stop()?;
        out.write_struct_end()
    }

    fn read_value(input: &mut dyn InputProtocol) -> Result<Self> {
        read_struct(input, |input, field| skip(input, field.ttype))?;
        Ok(GetAllUsersArgs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateUserArgs {
    pub user: User,
}

impl WireValue for UpdateUserArgs {
    const TTYPE: TType = TType::Struct;

    fn write_value(&self, out: &mut dyn OutputProtocol) -> Result<()> {
        out.write_struct_begin("updateUser_args")?;
        write_field(out, 1, &self.user)?;
        out.write_field_stop()?;
        out.write_struct_end()
    }

    fn read_value(input: &mut dyn InputProtocol) -> Result<Self> {
        let mut user = None;
        read_struct(input, |input, field| {
            match field.id {
                1 => user = read_field(input, field)?,
                _ => skip(input, field.ttype)?,
            }
            Ok(())
        })?;
        Ok(UpdateUserArgs {
            user: required(user, "updateUser_args", "user")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidateUserDataArgs {
    /// Absent on the wire when `None`.
    pub name: Option<String>,
    pub age: i32,
    pub is_active: bool,
}

impl WireValue for ValidateUserDataArgs {
    const TTYPE: TType = TType::Struct;

    fn write_value(&self, out: &mut dyn OutputProtocol) -> Result<()> {
        out.write_struct_begin("validateUserData_args")?;
        write_optional_field(out, 1, self.name.as_ref())?;
        write_field(out, 2, &self.age)?;
        write_field(out, 3, &self.is_active)?;
        out.write_field_stop()?;
        out.write_struct_end()
    }

    fn read_value(input: &mut dyn InputProtocol) -> Result<Self> {
        let (mut name, mut age, mut is_active) = (None, None, None);
        read_struct(input, |input, field| {
            match field.id {
                1 => name = read_field(input, field)?,
                2 => age = read_field(input, field)?,
                3 => is_active = read_field(input, field)?,
                _ => skip(input, field.ttype)?,
            }
            Ok(())
        })?;
        Ok(ValidateUserDataArgs {
            name,
            age: required(age, "validateUserData_args", "age")?,
            is_active: required(is_active, "validateUserData_args", "isActive")?,
        })
    }
}

/// One `logUserActivity` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogUserActivityArgs {
    pub action: String,
    pub user_id: i64,
    pub timestamp: String,
}

impl WireValue for LogUserActivityArgs {
    const TTYPE: TType = TType::Struct;

    fn write_value(&self, out: &mut dyn OutputProtocol) -> Result<()> {
        out.write_struct_begin("logUserActivity_args")?;
        write_field(out, 1, &self.action)?;
        write_field(out, 2, &self.user_id)?;
        write_field(out, 3, &self.timestamp)?;
        out.write_field_stop()?;
        out.write_struct_end()
    }

    fn read_value(input: &mut dyn InputProtocol) -> Result<Self> {
        let (mut action, mut user_id, mut timestamp) = (None, None, None);
        read_struct(input, |input, field| {
            match field.id {
                1 => action = read_field(input, field)?,
                2 => user_id = read_field(input, field)?,
                3 => timestamp = read_field(input, field)?,
                _ => skip(input, field.ttype)?,
            }
            Ok(())
        })?;
        Ok(LogUserActivityArgs {
            action: required(action, "logUserActivity_args", "action")?,
            user_id: required(user_id, "logUserActivity_args", "userId")?,
            timestamp: required(timestamp, "logUserActivity_args", "timestamp")?,
        })
    }
}

/// Outcome of a typed operation.
pub type CallResult<T, E = Infallible> = std::result::Result<T, CallError<E>>;

/// Typed caller for the user service.
pub struct UserServiceClient<S> {
    client: RpcClient<S>,
}

impl UserServiceClient<TcpStream> {
    /// Connect over TCP as configured.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        Ok(Self::new(RpcClient::connect(config).await?))
    }
}

impl<S> UserServiceClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(client: RpcClient<S>) -> Self {
        Self { client }
    }

    /// The underlying dispatcher.
    pub fn into_inner(self) -> RpcClient<S> {
        self.client
    }

    pub fn is_open(&self) -> bool {
        self.client.is_open()
    }

    pub async fn close(&mut self) {
        self.client.close().await;
    }

    pub async fn create_user(&mut self, name: impl Into<String>, age: i32) -> CallResult<User> {
        let args = CreateUserArgs {
            name: name.into(),
            age,
        };
        let reply: Reply<User, Infallible> = self.client.call(method::CREATE_USER, &args).await?;
        reply.into_result()
    }

    pub async fn get_user(&mut self, user_id: i64) -> CallResult<User, UserNotFound> {
        let reply: Reply<User, UserNotFound> = self
            .client
            .call(method::GET_USER, &GetUserArgs { user_id })
            .await?;
        reply.into_result()
    }

    pub async fn get_all_users(&mut self) -> CallResult<Vec<User>> {
        let reply: Reply<Vec<User>, Infallible> = self
            .client
            .call(method::GET_ALL_USERS, &GetAllUsersArgs)
            .await?;
        reply.into_result()
    }

    /// Replace the stored user with the same id.
    pub async fn update_user(&mut self, user: User) -> CallResult<User, UserNotFound> {
        let reply: Reply<User, UserNotFound> = self
            .client
            .call(method::UPDATE_USER, &UpdateUserArgs { user })
            .await?;
        reply.into_result()
    }

    pub async fn delete_user(&mut self, user_id: i64) -> CallResult<(), UserNotFound> {
        let reply: VoidReply<UserNotFound> = self
            .client
            .call(method::DELETE_USER, &DeleteUserArgs { user_id })
            .await?;
        reply.into_result()
    }

    /// Returns a confirmation message for valid input.
    ///
    /// Invalid input is rejected by the service with a protocol exception,
    /// see [`CallError::application`].
    pub async fn validate_user_data(
        &mut self,
        name: Option<&str>,
        age: i32,
        is_active: bool,
    ) -> CallResult<String> {
        let args = ValidateUserDataArgs {
            name: name.map(str::to_string),
            age,
            is_active,
        };
        let reply: Reply<String, Infallible> =
            self.client.call(method::VALIDATE_USER_DATA, &args).await?;
        reply.into_result()
    }

    /// Fire-and-forget; failures on the remote side are never reported.
    pub async fn log_user_activity(
        &mut self,
        action: impl Into<String>,
        user_id: i64,
        timestamp: impl Into<String>,
    ) -> Result<()> {
        let args = LogUserActivityArgs {
            action: action.into(),
            user_id,
            timestamp: timestamp.into(),
        };
        self.client.oneway(method::LOG_USER_ACTIVITY, &args).await
    }
}

/// Boxed future returned by handler methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Handler side of the user service.
///
/// Return [`CallError::Declared`] for declared exceptions and
/// `CallError::Rpc(WirecallError::Application(..))` to reject a request
/// with a protocol exception. Any other error is reported to the caller as
/// an `InternalError` protocol exception.
pub trait UserService: Send + Sync + 'static {
    fn create_user(&self, name: String, age: i32) -> BoxFuture<'_, CallResult<User>>;

    fn get_user(&self, user_id: i64) -> BoxFuture<'_, CallResult<User, UserNotFound>>;

    fn get_all_users(&self) -> BoxFuture<'_, CallResult<Vec<User>>>;

    fn update_user(&self, user: User) -> BoxFuture<'_, CallResult<User, UserNotFound>>;

    fn delete_user(&self, user_id: i64) -> BoxFuture<'_, CallResult<(), UserNotFound>>;

    fn validate_user_data(
        &self,
        name: Option<String>,
        age: i32,
        is_active: bool,
    ) -> BoxFuture<'_, CallResult<String>>;

    fn log_user_activity(&self, activity: LogUserActivityArgs) -> BoxFuture<'_, ()>;
}

/// Youngest and oldest accepted ages for `validateUserData`.
pub const AGE_RANGE: std::ops::RangeInclusive<i32> = 0..=150;

fn invalid_input(kind: ApplicationErrorKind, message: &str) -> CallError<Infallible> {
    WirecallError::Application(ApplicationException::new(kind, message)).into()
}

/// Check `validateUserData` input.
pub fn validate_user_data(name: Option<&str>, age: i32, is_active: bool) -> CallResult<String> {
    let name = match name.map(str::trim) {
        Some(name) if !name.is_empty() => name,
        _ => {
            return Err(invalid_input(
                ApplicationErrorKind::InvalidMessageType,
                "Name cannot be null or empty",
            ))
        }
    };
    if !AGE_RANGE.contains(&age) {
        return Err(invalid_input(
            ApplicationErrorKind::WrongMethodName,
            "Age must be between 0 and 150",
        ));
    }
    Ok(format!(
        "User data is valid: {} (age: {}, active: {})",
        name, age, is_active
    ))
}

/// Activity records kept by [`InMemoryUserService::new`].
pub const ACTIVITY_LOG_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct Store {
    users: BTreeMap<i64, User>,
    activity: VecDeque<LogUserActivityArgs>,
}

/// [`UserService`] keeping everything in memory.
///
/// Ids start at 1 and are never reused. Only the most recent activity
/// records are kept.
#[derive(Debug)]
pub struct InMemoryUserService {
    store: Mutex<Store>,
    next_id: AtomicI64,
    activity_capacity: usize,
}

impl InMemoryUserService {
    pub fn new() -> Self {
        Self::with_activity_capacity(ACTIVITY_LOG_CAPACITY)
    }

    /// Keep at most `capacity` activity records, dropping the oldest first.
    pub fn with_activity_capacity(capacity: usize) -> Self {
        Self {
            store: Mutex::new(Store::default()),
            next_id: AtomicI64::new(1),
            activity_capacity: capacity,
        }
    }

    /// Retained activity records, oldest first.
    pub async fn activity_log(&self) -> Vec<LogUserActivityArgs> {
        self.store.lock().await.activity.iter().cloned().collect()
    }
}

impl Default for InMemoryUserService {
    fn default() -> Self {
        Self::new()
    }
}

impl UserService for InMemoryUserService {
    fn create_user(&self, name: String, age: i32) -> BoxFuture<'_, CallResult<User>> {
        Box::pin(async move {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let user = User { id, name, age };
            self.store.lock().await.users.insert(id, user.clone());
            tracing::debug!("Created user {}", id);
            Ok(user)
        })
    }

    fn get_user(&self, user_id: i64) -> BoxFuture<'_, CallResult<User, UserNotFound>> {
        Box::pin(async move {
            self.store
                .lock()
                .await
                .users
                .get(&user_id)
                .cloned()
                .ok_or_else(|| CallError::Declared(UserNotFound::for_id(user_id)))
        })
    }

    fn get_all_users(&self) -> BoxFuture<'_, CallResult<Vec<User>>> {
        Box::pin(async move { Ok(self.store.lock().await.users.values().cloned().collect()) })
    }

    fn update_user(&self, user: User) -> BoxFuture<'_, CallResult<User, UserNotFound>> {
        Box::pin(async move {
            let mut store = self.store.lock().await;
            match store.users.get_mut(&user.id) {
                Some(stored) => {
                    *stored = user.clone();
                    Ok(user)
                }
                None => Err(CallError::Declared(UserNotFound::for_id(user.id))),
            }
        })
    }

    fn delete_user(&self, user_id: i64) -> BoxFuture<'_, CallResult<(), UserNotFound>> {
        Box::pin(async move {
            match self.store.lock().await.users.remove(&user_id) {
                Some(_) => Ok(()),
                None => Err(CallError::Declared(UserNotFound::for_id(user_id))),
            }
        })
    }

    fn validate_user_data(
        &self,
        name: Option<String>,
        age: i32,
        is_active: bool,
    ) -> BoxFuture<'_, CallResult<String>> {
        Box::pin(async move { validate_user_data(name.as_deref(), age, is_active) })
    }

    fn log_user_activity(&self, activity: LogUserActivityArgs) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            tracing::info!(
                "User activity: {} by user {} at {}",
                activity.action,
                activity.user_id,
                activity.timestamp
            );
            if self.activity_capacity == 0 {
                return;
            }
            let mut store = self.store.lock().await;
            if store.activity.len() == self.activity_capacity {
                store.activity.pop_front();
            }
            store.activity.push_back(activity);
        })
    }
}
