#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use droplet_es::{
    Aggregate, AggregateDefinition, Applies, Command, Cqrs, EngineConfig, Event, EventPayload,
    EventStore, ExpectedVersion, Handles, InMemoryEventStore, Projects, Query, QueryResult,
    ReadModelDefinition, RecordedEvent, Result, StreamSource, Subscription, Uuid, ValidationError,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Barrier;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Account aggregate

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub account_id: Uuid,
    pub name: String,
    pub balance: i64,
    pub user_id: Option<Uuid>,
    pub created: bool,
}

impl Aggregate for Account {
    const NAME: &'static str = "Account";

    fn aggregate_id(&self) -> Uuid {
        self.account_id
    }

    fn set_aggregate_id(&mut self, id: Uuid) {
        self.account_id = id;
    }
}

pub struct CreateAccount {
    pub account_id: Option<Uuid>,
    pub name: String,
    pub user_id: Uuid,
}

impl Command for CreateAccount {
    fn aggregate_id(&self) -> Option<Uuid> {
        self.account_id
    }
}

pub struct AddFunds {
    pub account_id: Option<Uuid>,
    pub funds: i64,
}

impl Command for AddFunds {
    fn aggregate_id(&self) -> Option<Uuid> {
        self.account_id
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountCreated {
    pub account_id: Uuid,
    pub name: String,
    pub user_id: Uuid,
}

impl EventPayload for AccountCreated {
    const NAME: &'static str = "AccountCreated";

    fn aggregate_id(&self) -> Uuid {
        self.account_id
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FundsAdded {
    pub account_id: Uuid,
    pub funds: i64,
}

impl EventPayload for FundsAdded {
    const NAME: &'static str = "FundsAdded";

    fn aggregate_id(&self) -> Uuid {
        self.account_id
    }
}

impl Handles<CreateAccount> for Account {
    fn handle(&self, command: &CreateAccount) -> Result<Vec<Event>> {
        if self.created {
            return Err(ValidationError::field("account_id", "account already exists").into());
        }
        Ok(vec![Event::new(AccountCreated {
            account_id: self.account_id,
            name: command.name.clone(),
            user_id: command.user_id,
        })?])
    }
}

impl Handles<AddFunds> for Account {
    fn handle(&self, command: &AddFunds) -> Result<Vec<Event>> {
        if !self.created {
            return Err(ValidationError::field("account_id", "account does not exist").into());
        }
        if command.funds == 0 {
            return Ok(vec![]);
        }
        Ok(vec![Event::new(FundsAdded {
            account_id: self.account_id,
            funds: command.funds,
        })?])
    }
}

impl Applies<AccountCreated> for Account {
    fn apply(&mut self, event: &AccountCreated) {
        self.name = event.name.clone();
        self.user_id = Some(event.user_id);
        self.created = true;
    }
}

impl Applies<FundsAdded> for Account {
    fn apply(&mut self, event: &FundsAdded) {
        self.balance += event.funds;
    }
}

pub fn account_aggregate() -> AggregateDefinition<Account> {
    AggregateDefinition::new()
        .command::<CreateAccount>()
        .command::<AddFunds>()
        .event::<AccountCreated>()
        .event::<FundsAdded>()
}

// User aggregate

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub user_id: Uuid,
    pub username: Option<String>,
}

impl Aggregate for User {
    const NAME: &'static str = "User";

    fn aggregate_id(&self) -> Uuid {
        self.user_id
    }

    fn set_aggregate_id(&mut self, id: Uuid) {
        self.user_id = id;
    }
}

pub struct CreateUser {
    pub user_id: Uuid,
    pub username: String,
}

impl Command for CreateUser {
    fn aggregate_id(&self) -> Option<Uuid> {
        Some(self.user_id)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserCreated {
    pub user_id: Uuid,
    pub username: String,
}

impl EventPayload for UserCreated {
    const NAME: &'static str = "UserCreated";

    fn aggregate_id(&self) -> Uuid {
        self.user_id
    }
}

impl Handles<CreateUser> for User {
    fn handle(&self, command: &CreateUser) -> Result<Vec<Event>> {
        Ok(vec![Event::new(UserCreated {
            user_id: self.user_id,
            username: command.username.clone(),
        })?])
    }
}

impl Applies<UserCreated> for User {
    fn apply(&mut self, event: &UserCreated) {
        self.username = Some(event.username.clone());
    }
}

pub fn user_aggregate() -> AggregateDefinition<User> {
    AggregateDefinition::new()
        .command::<CreateUser>()
        .event::<UserCreated>()
}

// Read models

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AccountDetails {
    pub account_id: Option<Uuid>,
    pub name: String,
    pub balance: i64,
    pub user_id: Option<Uuid>,
    pub username: Option<String>,
    pub events_applied: u32,
}

impl Projects<AccountCreated> for AccountDetails {
    fn on(&mut self, event: &AccountCreated) -> anyhow::Result<()> {
        self.account_id = Some(event.account_id);
        self.name = event.name.clone();
        self.user_id = Some(event.user_id);
        self.events_applied += 1;
        Ok(())
    }
}

impl Projects<FundsAdded> for AccountDetails {
    fn on(&mut self, event: &FundsAdded) -> anyhow::Result<()> {
        self.balance += event.funds;
        self.events_applied += 1;
        Ok(())
    }
}

impl Projects<UserCreated> for AccountDetails {
    fn on(&mut self, event: &UserCreated) -> anyhow::Result<()> {
        self.username = Some(event.username.clone());
        self.events_applied += 1;
        Ok(())
    }
}

pub struct GetAccountById(pub Uuid);

impl Query for GetAccountById {
    type Output = AccountDetails;
}

pub struct GetAccountsByUser(pub Uuid);

impl Query for GetAccountsByUser {
    type Output = Vec<AccountDetails>;
}

/// Ephemeral account lookups: accounts are tailed, users are read on demand.
pub fn account_details(idle_timeout: Duration) -> ReadModelDefinition<AccountDetails> {
    ReadModelDefinition::keyed("AccountDetails", |d: &AccountDetails| d.account_id)
        .foreign_key("user_id", |d: &AccountDetails| d.user_id)
        .stream(StreamSource::of_aggregate::<Account>())
        .stream(StreamSource::of_aggregate::<User>().unsubscribed())
        .ephemeral(idle_timeout)
        .on::<AccountCreated>()
        .on::<FundsAdded>()
        .on_foreign::<UserCreated>("user_id")
        .query(|cache, q: &GetAccountById| Ok(cache.get(&q.0).cloned()))
        .query(|cache, q: &GetAccountsByUser| {
            let accounts: Vec<AccountDetails> =
                cache.find_by("user_id", &q.0).into_iter().cloned().collect();
            Ok((!accounts.is_empty()).then_some(accounts))
        })
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AccountSummary {
    pub accounts: u32,
    pub total_funds: i64,
}

impl Projects<AccountCreated> for AccountSummary {
    fn on(&mut self, _event: &AccountCreated) -> anyhow::Result<()> {
        self.accounts += 1;
        Ok(())
    }
}

impl Projects<FundsAdded> for AccountSummary {
    fn on(&mut self, event: &FundsAdded) -> anyhow::Result<()> {
        self.total_funds += event.funds;
        Ok(())
    }
}

pub struct GetAccountSummary;

impl Query for GetAccountSummary {
    type Output = AccountSummary;
}

/// Persistent totals over the event-type streams.
pub fn account_summary() -> ReadModelDefinition<AccountSummary> {
    ReadModelDefinition::single("AccountSummary")
        .stream(StreamSource::of_event::<FundsAdded>())
        .stream(StreamSource::of_event::<AccountCreated>())
        .on::<AccountCreated>()
        .on::<FundsAdded>()
        .query(|cache, _: &GetAccountSummary| Ok(cache.single().cloned()))
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DirectoryEntry {
    pub account_id: Option<Uuid>,
    pub name: String,
}

impl Projects<AccountCreated> for DirectoryEntry {
    fn on(&mut self, event: &AccountCreated) -> anyhow::Result<()> {
        self.account_id = Some(event.account_id);
        self.name = event.name.clone();
        Ok(())
    }
}

pub struct FindAccount(pub Uuid);

impl Query for FindAccount {
    type Output = DirectoryEntry;
}

/// Persistent, subscription-fed directory of account names.
pub fn account_directory() -> ReadModelDefinition<DirectoryEntry> {
    ReadModelDefinition::keyed("AccountDirectory", |e: &DirectoryEntry| e.account_id)
        .stream(StreamSource::of_event::<AccountCreated>())
        .on::<AccountCreated>()
        .query(|cache, q: &FindAccount| Ok(cache.get(&q.0).cloned()))
}

pub async fn engine(store: Arc<dyn EventStore>, idle_timeout: Duration) -> Cqrs {
    Cqrs::builder(store)
        .aggregate(account_aggregate())
        .unwrap()
        .aggregate(user_aggregate())
        .unwrap()
        .read_model(account_details(idle_timeout))
        .unwrap()
        .read_model(account_summary())
        .unwrap()
        .read_model(account_directory())
        .unwrap()
        .config(EngineConfig::default().with_eviction_interval(Duration::from_millis(500)))
        .start()
        .await
        .unwrap()
}

pub async fn create_account(cqrs: &Cqrs, name: &str, user_id: Uuid) -> Uuid {
    let account_id = Uuid::new_v4();
    cqrs.execute_command(CreateAccount {
        account_id: Some(account_id),
        name: name.to_string(),
        user_id,
    })
    .await
    .unwrap();
    account_id
}

/// Queries until `ready` accepts the answer, for read models fed by subscriptions.
pub async fn eventually<Q, F>(cqrs: &Cqrs, query: impl Fn() -> Q, ready: F) -> Option<Q::Output>
where
    Q: Query,
    F: Fn(&Q::Output) -> bool,
{
    for _ in 0..200 {
        if let QueryResult::Found(output) = cqrs.execute_query(query()).await {
            if ready(&output) {
                return Some(output);
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    None
}

/// Store wrapper recording which streams `read_from` was called on.
#[derive(Clone, Default)]
pub struct CountingStore {
    pub inner: InMemoryEventStore,
    reads: Arc<Mutex<Vec<String>>>,
}

impl CountingStore {
    pub fn reads(&self) -> usize {
        self.reads.lock().unwrap().len()
    }

    pub fn reads_of(&self, stream: &str) -> usize {
        self.reads.lock().unwrap().iter().filter(|s| *s == stream).count()
    }
}

#[async_trait]
impl EventStore for CountingStore {
    async fn append(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        events: &[Event],
    ) -> Result<Option<u64>> {
        self.inner.append(stream, expected, events).await
    }

    async fn read_from(&self, stream: &str, from: u64) -> Result<Vec<RecordedEvent>> {
        self.reads.lock().unwrap().push(stream.to_string());
        self.inner.read_from(stream, from).await
    }

    async fn subscribe(&self, stream: &str, checkpoint: Option<u64>) -> Result<Subscription> {
        self.inner.subscribe(stream, checkpoint).await
    }
}

/// Store wrapper delaying every read of one stream.
pub struct SlowStore {
    pub inner: InMemoryEventStore,
    stream: String,
    delay: Duration,
}

impl SlowStore {
    pub fn new(inner: InMemoryEventStore, stream: &str, delay: Duration) -> Self {
        Self {
            inner,
            stream: stream.to_string(),
            delay,
        }
    }
}

#[async_trait]
impl EventStore for SlowStore {
    async fn append(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        events: &[Event],
    ) -> Result<Option<u64>> {
        self.inner.append(stream, expected, events).await
    }

    async fn read_from(&self, stream: &str, from: u64) -> Result<Vec<RecordedEvent>> {
        if stream == self.stream {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.read_from(stream, from).await
    }

    async fn subscribe(&self, stream: &str, checkpoint: Option<u64>) -> Result<Subscription> {
        self.inner.subscribe(stream, checkpoint).await
    }
}

/// Store wrapper holding aggregate-stream reads until `parties` readers arrived.
pub struct GatedStore {
    pub inner: InMemoryEventStore,
    gate: Barrier,
}

impl GatedStore {
    pub fn new(inner: InMemoryEventStore, parties: usize) -> Self {
        Self {
            inner,
            gate: Barrier::new(parties),
        }
    }
}

#[async_trait]
impl EventStore for GatedStore {
    async fn append(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        events: &[Event],
    ) -> Result<Option<u64>> {
        self.inner.append(stream, expected, events).await
    }

    async fn read_from(&self, stream: &str, from: u64) -> Result<Vec<RecordedEvent>> {
        let history = self.inner.read_from(stream, from).await?;
        if !stream.starts_with('$') {
            self.gate.wait().await;
        }
        Ok(history)
    }

    async fn subscribe(&self, stream: &str, checkpoint: Option<u64>) -> Result<Subscription> {
        self.inner.subscribe(stream, checkpoint).await
    }
}
