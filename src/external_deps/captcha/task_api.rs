//! `createTask` / `getTaskResult` JSON protocol spoken by AntiCaptcha and
//! CapMonster.

use serde::{Deserialize, Serialize};
use url::Url;

use super::{CaptchaError, CaptchaTask, endpoint, post_json};
use crate::challenges::core::HttpTransport;
use crate::modules::proxy::ProxyDescriptor;

pub(crate) const PROXYLESS_TASK: &str = "NoCaptchaTaskProxyless";
pub(crate) const PROXY_TASK: &str = "NoCaptchaTask";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskRequest<'a> {
    client_key: &'a str,
    task: TaskPayload<'a>,
}

#[derive(Debug, Serialize)]
pub(crate) struct TaskPayload<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(rename = "websiteURL")]
    website_url: &'a str,
    #[serde(rename = "websiteKey")]
    website_key: &'a str,
    #[serde(flatten)]
    proxy: Option<ProxyFields<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProxyFields<'a> {
    proxy_type: &'static str,
    proxy_address: &'a str,
    proxy_port: u16,
    proxy_login: &'a str,
    proxy_password: &'a str,
}

impl<'a> TaskPayload<'a> {
    pub(crate) fn proxyless(task: &'a CaptchaTask) -> Self {
        Self {
            kind: PROXYLESS_TASK,
            website_url: &task.page_url,
            website_key: &task.site_key,
            proxy: None,
        }
    }

    pub(crate) fn with_proxy(task: &'a CaptchaTask, proxy: &'a ProxyDescriptor) -> Self {
        Self {
            kind: PROXY_TASK,
            website_url: &task.page_url,
            website_key: &task.site_key,
            proxy: Some(ProxyFields {
                proxy_type: "https",
                proxy_address: &proxy.host,
                proxy_port: proxy.port,
                proxy_login: &proxy.username,
                proxy_password: &proxy.password,
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskResponse {
    #[serde(default)]
    error_id: i64,
    error_code: Option<String>,
    error_description: Option<String>,
    task_id: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskResultRequest<'a> {
    client_key: &'a str,
    task_id: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TaskResultResponse {
    #[serde(default)]
    error_id: i64,
    error_code: Option<String>,
    error_description: Option<String>,
    #[serde(default)]
    pub status: String,
    solution: Option<TaskSolution>,
}

#[derive(Debug, Deserialize)]
struct TaskSolution {
    #[serde(rename = "gRecaptchaResponse", default)]
    g_recaptcha_response: String,
}

impl TaskResultResponse {
    pub(crate) fn is_ready(&self) -> bool {
        self.status == "ready"
    }

    pub(crate) fn is_processing(&self) -> bool {
        self.status == "processing"
    }

    /// The solved value, failing when the provider returned none.
    pub(crate) fn into_token(self) -> Result<String, CaptchaError> {
        self.solution
            .map(|solution| solution.g_recaptcha_response)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| CaptchaError::Protocol("solution missing gRecaptchaResponse".into()))
    }
}

fn api_error(
    error_id: i64,
    code: Option<String>,
    description: Option<String>,
) -> Result<(), CaptchaError> {
    if error_id == 0 {
        return Ok(());
    }
    Err(CaptchaError::Api {
        code: code.unwrap_or_else(|| error_id.to_string()),
        description: description.unwrap_or_default(),
    })
}

/// Submit a task and return its job id.
pub(crate) async fn create_task(
    transport: &dyn HttpTransport,
    base_url: &Url,
    client_key: &str,
    task: TaskPayload<'_>,
) -> Result<u64, CaptchaError> {
    let url = endpoint(base_url, "createTask")?;
    let request = CreateTaskRequest { client_key, task };
    let response: CreateTaskResponse = post_json(transport, &url, &request).await?.json()?;
    api_error(
        response.error_id,
        response.error_code,
        response.error_description,
    )?;

    match response.task_id {
        Some(id) if id != 0 => Ok(id),
        Some(_) => Err(CaptchaError::Protocol("task number of irregular format".into())),
        None => Err(CaptchaError::Protocol(
            "task number not found in server response".into(),
        )),
    }
}

/// Poll the state of a previously created task once.
pub(crate) async fn task_result(
    transport: &dyn HttpTransport,
    base_url: &Url,
    client_key: &str,
    task_id: u64,
) -> Result<TaskResultResponse, CaptchaError> {
    let url = endpoint(base_url, "getTaskResult")?;
    let request = TaskResultRequest {
        client_key,
        task_id,
    };
    let response: TaskResultResponse = post_json(transport, &url, &request).await?.json()?;
    api_error(
        response.error_id,
        response.error_code.clone(),
        response.error_description.clone(),
    )?;
    Ok(response)
}
