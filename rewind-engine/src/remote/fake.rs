//! In-memory platform instance for tests.

use super::rest::COLLECTION_LIMIT;
use super::{AuthGrant, QueryPage, Record, RemoteApi, WriteMode, WriteResult};
use crate::schema::{FieldDescribe, FieldType, ObjectDescribe};
use crate::session::{Credentials, Session};
use crate::utils::errors::{self, RemoteError};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Hook = Arc<dyn Fn(&str, usize) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct WriteCall {
    pub object: String,
    pub mode: WriteMode,
    pub records: Vec<Record>,
}

struct Cursor {
    object: String,
    fields: Vec<String>,
    offset: usize,
    batch_size: usize,
    pages: usize,
}

#[derive(Default)]
struct State {
    describes: HashMap<String, ObjectDescribe>,
    tables: BTreeMap<String, Vec<Record>>,
    generated: HashMap<String, usize>,
    cursors: HashMap<String, Cursor>,
    valid_tokens: HashSet<String>,
    writes: Vec<WriteCall>,
    reject_rules: Vec<(String, String, Value)>,
    failing_writes: HashSet<String>,
    failing_pages: HashMap<String, usize>,
    reject_all_sessions: bool,
    reject_credentials: bool,
    fail_next: usize,
    call_delay: Option<Duration>,
    auth_delay: Option<Duration>,
    page_hook: Option<Hook>,
    write_hook: Option<Hook>,
    next_token: usize,
    next_cursor: usize,
    next_id: usize,
}

#[derive(Default)]
pub struct FakeApi {
    state: Mutex<State>,
    auth_attempts: AtomicUsize,
    describe_calls: AtomicUsize,
    invalid_session_hits: AtomicUsize,
    largest_page: AtomicUsize,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account and Contact with a handful of related rows.
    pub fn crm() -> Self {
        let api = Self::new()
            .with_object(account_describe())
            .with_object(contact_describe());
        api.insert_rows(
            "Account",
            vec![
                record(json!({"Id": "001S00000000001", "Name": "Acme", "ParentId": null, "AnnualRevenue": 1200000.5, "IsActive": true})),
                record(json!({"Id": "001S00000000002", "Name": "Acme EMEA", "ParentId": "001S00000000001", "AnnualRevenue": null, "IsActive": false})),
            ],
        );
        api.insert_rows(
            "Contact",
            vec![
                record(json!({"Id": "003S00000000001", "LastName": "Ng", "Email": "ng@acme.test", "AccountId": "001S00000000001", "ReportsToId": null})),
                record(json!({"Id": "003S00000000002", "LastName": "Okafor", "Email": null, "AccountId": "001S00000000002", "ReportsToId": "003S00000000001"})),
                record(json!({"Id": "003S00000000003", "LastName": "Lindqvist", "Email": "l@acme.test", "AccountId": "001S00000000001", "ReportsToId": "003S00000000002"})),
            ],
        );
        api
    }

    /// Closure-compatible credential source for tests.
    pub fn credentials() -> errors::Result<Credentials> {
        Ok(Credentials::new("ops@example.com", "hunter2", "tok", "secret"))
    }

    pub fn with_object(self, describe: ObjectDescribe) -> Self {
        self.lock().describes.insert(describe.name.clone(), describe);
        self
    }

    pub fn insert_rows(&self, object: &str, rows: Vec<Record>) {
        self.lock().tables.entry(object.to_string()).or_default().extend(rows);
    }

    /// Serve `count` synthetic rows for `object` without storing them.
    pub fn generate_rows(&self, object: &str, count: usize) {
        self.lock().generated.insert(object.to_string(), count);
    }

    pub fn rows(&self, object: &str) -> Vec<Record> {
        self.lock().tables.get(object).cloned().unwrap_or_default()
    }

    pub fn writes(&self) -> Vec<WriteCall> {
        self.lock().writes.clone()
    }

    pub fn writes_for(&self, object: &str) -> Vec<WriteCall> {
        self.writes().into_iter().filter(|w| w.object == object).collect()
    }

    /// Invalidate every token issued so far; new logins still succeed.
    pub fn revoke_sessions(&self) {
        self.lock().valid_tokens.clear();
    }

    pub fn reject_all_sessions(&self, on: bool) {
        self.lock().reject_all_sessions = on;
    }

    pub fn reject_credentials(&self, on: bool) {
        self.lock().reject_credentials = on;
    }

    /// The next `n` data calls fail with a transient error.
    pub fn fail_next_calls(&self, n: usize) {
        self.lock().fail_next = n;
    }

    pub fn set_call_delay(&self, delay: Duration) {
        self.lock().call_delay = Some(delay);
    }

    /// Logins take `delay` before answering.
    pub fn set_auth_delay(&self, delay: Duration) {
        self.lock().auth_delay = Some(delay);
    }

    /// Creates whose `field` equals `value` on `object` are refused.
    pub fn reject_records_where(&self, object: &str, field: &str, value: Value) {
        self.lock()
            .reject_rules
            .push((object.to_string(), field.to_string(), value));
    }

    pub fn fail_writes(&self, object: &str, on: bool) {
        let mut state = self.lock();
        if on {
            state.failing_writes.insert(object.to_string());
        } else {
            state.failing_writes.remove(object);
        }
    }

    /// Paging for `object` is rejected once `pages` pages were served.
    pub fn fail_query_after(&self, object: &str, pages: usize) {
        self.lock().failing_pages.insert(object.to_string(), pages);
    }

    /// Called with the object name and page number after each page is served.
    pub fn on_page(&self, hook: impl Fn(&str, usize) + Send + Sync + 'static) {
        self.lock().page_hook = Some(Arc::new(hook));
    }

    /// Called with the object name and the running write count after each bulk write.
    pub fn on_write(&self, hook: impl Fn(&str, usize) + Send + Sync + 'static) {
        self.lock().write_hook = Some(Arc::new(hook));
    }

    pub fn auth_attempts(&self) -> usize {
        self.auth_attempts.load(Ordering::SeqCst)
    }

    pub fn describe_calls(&self) -> usize {
        self.describe_calls.load(Ordering::SeqCst)
    }

    pub fn invalid_session_hits(&self) -> usize {
        self.invalid_session_hits.load(Ordering::SeqCst)
    }

    /// Most records handed out in a single page.
    pub fn largest_page(&self) -> usize {
        self.largest_page.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Shared preamble of every data call: delay, session check, injected failures.
    async fn admit(&self, session: &Session) -> Result<(), RemoteError> {
        let delay = self.lock().call_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        if state.reject_all_sessions || !state.valid_tokens.contains(session.access_token()) {
            self.invalid_session_hits.fetch_add(1, Ordering::SeqCst);
            return Err(RemoteError::InvalidSession("INVALID_SESSION_ID".into()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(RemoteError::Transient("503 Service Unavailable".into()));
        }
        Ok(())
    }

    fn serve_page(&self, locator: String) -> Result<QueryPage, RemoteError> {
        let (page, hook, object, number) = {
            let mut state = self.lock();
            let mut cursor = state
                .cursors
                .remove(&locator)
                .ok_or_else(|| RemoteError::Rejected(format!("INVALID_QUERY_LOCATOR: {}", locator)))?;

            if let Some(&limit) = state.failing_pages.get(&cursor.object) {
                if cursor.pages >= limit {
                    return Err(RemoteError::Rejected(format!(
                        "QUERY_TIMEOUT on {}",
                        cursor.object
                    )));
                }
            }

            let total = match state.generated.get(&cursor.object) {
                Some(&n) => n,
                None => state.tables.get(&cursor.object).map_or(0, Vec::len),
            };
            let end = (cursor.offset + cursor.batch_size).min(total);
            let records: Vec<Record> = (cursor.offset..end)
                .map(|i| match state.generated.get(&cursor.object) {
                    Some(_) => synthetic_row(&cursor.object, i, &cursor.fields),
                    None => project(&state.tables[&cursor.object][i], &cursor.fields),
                })
                .collect();

            cursor.offset = end;
            cursor.pages += 1;
            let number = cursor.pages;
            let object = cursor.object.clone();
            let next = if end < total {
                state.cursors.insert(locator.clone(), cursor);
                Some(locator)
            } else {
                None
            };
            self.largest_page.fetch_max(records.len(), Ordering::SeqCst);
            let page = QueryPage {
                records,
                total_size: Some(total as u64),
                next,
            };
            (page, state.page_hook.clone(), object, number)
        };
        if let Some(hook) = hook {
            hook(&object, number);
        }
        Ok(page)
    }
}

#[async_trait]
impl RemoteApi for FakeApi {
    async fn authenticate(&self, credentials: &Credentials) -> Result<AuthGrant, RemoteError> {
        self.auth_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = self.lock().auth_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        if state.reject_credentials || credentials.password().is_empty() {
            return Err(RemoteError::AuthFailed("INVALID_LOGIN".into()));
        }
        state.next_token += 1;
        let token = format!("00D!token{}", state.next_token);
        state.valid_tokens.insert(token.clone());
        Ok(AuthGrant {
            access_token: token,
            instance_url: "https://fake.my.platform.test".into(),
            issued_at: Utc::now(),
        })
    }

    async fn describe(&self, session: &Session, object: &str) -> Result<ObjectDescribe, RemoteError> {
        self.admit(session).await?;
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        self.lock()
            .describes
            .get(object)
            .cloned()
            .ok_or_else(|| RemoteError::Rejected(format!("NOT_FOUND: sObject type '{}'", object)))
    }

    async fn query(
        &self,
        session: &Session,
        object: &str,
        fields: &[String],
        batch_size: usize,
    ) -> Result<QueryPage, RemoteError> {
        self.admit(session).await?;
        let locator = {
            let mut state = self.lock();
            if !state.describes.contains_key(object) {
                return Err(RemoteError::Rejected(format!("INVALID_TYPE: {}", object)));
            }
            state.next_cursor += 1;
            let locator = format!("01g-{}", state.next_cursor);
            state.cursors.insert(
                locator.clone(),
                Cursor {
                    object: object.to_string(),
                    fields: fields.to_vec(),
                    offset: 0,
                    batch_size: batch_size.max(1),
                    pages: 0,
                },
            );
            locator
        };
        self.serve_page(locator)
    }

    async fn query_more(&self, session: &Session, locator: &str) -> Result<QueryPage, RemoteError> {
        self.admit(session).await?;
        self.serve_page(locator.to_string())
    }

    async fn bulk_write(
        &self,
        session: &Session,
        object: &str,
        mode: WriteMode,
        records: &[Record],
    ) -> Result<Vec<WriteResult>, RemoteError> {
        self.admit(session).await?;
        let (results, hook, count) = self.apply_writes(object, mode, records)?;
        if let Some(hook) = hook {
            hook(object, count);
        }
        Ok(results)
    }
}

impl FakeApi {
    fn apply_writes(
        &self,
        object: &str,
        mode: WriteMode,
        records: &[Record],
    ) -> Result<(Vec<WriteResult>, Option<Hook>, usize), RemoteError> {
        if records.len() > COLLECTION_LIMIT {
            return Err(RemoteError::Rejected(format!(
                "EXCEEDED_ID_LIMIT: {} records in one collection",
                records.len()
            )));
        }
        let mut state = self.lock();
        if state.failing_writes.contains(object) {
            return Err(RemoteError::Rejected(format!("UNABLE_TO_LOCK_ROW on {}", object)));
        }
        state.writes.push(WriteCall {
            object: object.to_string(),
            mode,
            records: records.to_vec(),
        });

        let mut results = Vec::with_capacity(records.len());
        for record in records {
            let refused = state
                .reject_rules
                .iter()
                .find(|(o, f, v)| o == object && record.get(f) == Some(v));
            if let Some((_, field, _)) = refused {
                results.push(WriteResult::failed(format!(
                    "FIELD_CUSTOM_VALIDATION_EXCEPTION: {}",
                    field
                )));
                continue;
            }

            match mode {
                WriteMode::Create => {
                    state.next_id += 1;
                    let id = format!("{}T{:011}", key_prefix(object), state.next_id);
                    let mut stored = record.clone();
                    stored.insert("Id".into(), Value::String(id.clone()));
                    state.tables.entry(object.to_string()).or_default().push(stored);
                    results.push(WriteResult::created(id));
                }
                WriteMode::Update => {
                    let id = record.get("Id").and_then(Value::as_str).unwrap_or_default();
                    let row = state
                        .tables
                        .get_mut(object)
                        .and_then(|rows| {
                            rows.iter_mut()
                                .find(|r| r.get("Id").and_then(Value::as_str) == Some(id))
                        });
                    match row {
                        Some(row) => {
                            row.extend(record.clone());
                            results.push(WriteResult::created(id));
                        }
                        None => results.push(WriteResult::failed("ENTITY_IS_DELETED")),
                    }
                }
            }
        }
        Ok((results, state.write_hook.clone(), state.writes.len()))
    }
}

pub fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => panic!("not a record: {other}"),
    }
}

pub fn account_describe() -> ObjectDescribe {
    ObjectDescribe::new(
        "Account",
        vec![
            FieldDescribe::new("Id", FieldType::Id).required().read_only(),
            FieldDescribe::new("Name", FieldType::String).required(),
            FieldDescribe::reference("ParentId", ["Account"]),
            FieldDescribe::new("AnnualRevenue", FieldType::Currency),
            FieldDescribe::new("IsActive", FieldType::Boolean).required(),
            FieldDescribe::new("BillingAddress", FieldType::Address).read_only(),
        ],
    )
}

pub fn contact_describe() -> ObjectDescribe {
    ObjectDescribe::new(
        "Contact",
        vec![
            FieldDescribe::new("Id", FieldType::Id).required().read_only(),
            FieldDescribe::new("LastName", FieldType::String).required(),
            FieldDescribe::new("Email", FieldType::Email),
            FieldDescribe::reference("AccountId", ["Account"]).required(),
            FieldDescribe::reference("ReportsToId", ["Contact"]),
        ],
    )
}

fn key_prefix(object: &str) -> String {
    object.chars().take(3).collect::<String>().to_ascii_uppercase()
}

fn project(row: &Record, fields: &[String]) -> Record {
    fields
        .iter()
        .map(|f| (f.clone(), row.get(f).cloned().unwrap_or(Value::Null)))
        .collect()
}

fn synthetic_row(object: &str, index: usize, fields: &[String]) -> Record {
    fields
        .iter()
        .map(|f| {
            let value = match f.as_str() {
                "Id" => Value::String(format!("{}S{:011}", key_prefix(object), index)),
                _ => Value::String(format!("{} {}", f, index)),
            };
            (f.clone(), value)
        })
        .collect()
}
