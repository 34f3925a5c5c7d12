//! Run identity and endpoint layout
//!
//! A component page lives at `<base>/publix/<runId>/<componentId>/start`.
//! Run-scoped endpoints hang off `<base>/publix/<runId>/`, component-scoped
//! ones off `<base>/publix/<runId>/<componentId>/`.

use studyrun_protocol::ChannelKind;
use url::Url;

use crate::error::{StudyError, StudyResult};

const PUBLIX: &str = "publix";

/// URLs of one study run as seen from one component
#[derive(Debug, Clone, PartialEq)]
pub struct RunUrls {
    run_id: String,
    component_id: String,
    run_base: Url,
    component_base: Url,
}

impl RunUrls {
    /// `base` is the server origin plus any deployment prefix.
    pub fn new(base: &str, run_id: &str, component_id: &str) -> StudyResult<Self> {
        if run_id.is_empty() || component_id.is_empty() {
            return Err(StudyError::Url("run and component ids must not be empty".to_string()));
        }
        let mut base = Url::parse(base)?;
        {
            let mut segments = base
                .path_segments_mut()
                .map_err(|_| StudyError::Url("base URL cannot have a path".to_string()))?;
            segments.pop_if_empty().push(PUBLIX).push(run_id).push("");
        }
        base.set_query(None);
        base.set_fragment(None);
        let component_base = base.join(&format!("{component_id}/"))?;

        Ok(Self {
            run_id: run_id.to_string(),
            component_id: component_id.to_string(),
            run_base: base,
            component_base,
        })
    }

    /// Derive the layout from the URL a component was started with.
    pub fn from_component_url(component_url: &str) -> StudyResult<Self> {
        let url = Url::parse(component_url)?;
        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.collect())
            .unwrap_or_default();
        let publix = segments
            .iter()
            .position(|s| *s == PUBLIX)
            .ok_or_else(|| StudyError::Url(format!("no /{PUBLIX}/ segment in {component_url}")))?;
        let run_id = segments
            .get(publix + 1)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| StudyError::Url(format!("no run id in {component_url}")))?;
        let component_id = segments
            .get(publix + 2)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| StudyError::Url(format!("no component id in {component_url}")))?;

        let mut base = url.clone();
        base.set_query(None);
        base.set_fragment(None);
        base.set_path(&format!("/{}", segments[..publix].join("/")));
        Self::new(base.as_str(), run_id, component_id)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn component_id(&self) -> &str {
        &self.component_id
    }

    pub fn run_base(&self) -> &Url {
        &self.run_base
    }

    fn run(&self, path: &str) -> Url {
        self.run_base.join(path).unwrap_or_else(|_| self.run_base.clone())
    }

    fn component(&self, path: &str) -> Url {
        self.component_base
            .join(path)
            .unwrap_or_else(|_| self.component_base.clone())
    }

    pub fn init_data(&self) -> String {
        self.component("initData").into()
    }

    pub fn result_data(&self) -> String {
        self.component("resultData").into()
    }

    pub fn log(&self) -> String {
        self.component("log").into()
    }

    fn file_url(&self, name: &str) -> Url {
        let mut url = self.component("files");
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push(name);
        }
        url
    }

    /// Upload target of a result file
    pub fn file(&self, name: &str) -> String {
        self.file_url(name).into()
    }

    /// Download location of a result file, optionally one of another component
    pub fn file_download(&self, name: &str, component_id: Option<&str>) -> String {
        let mut url = self.file_url(name);
        if let Some(id) = component_id {
            url.query_pairs_mut().append_pair("componentId", id);
        }
        url.into()
    }

    pub fn heartbeat(&self) -> String {
        self.run("heartbeat").into()
    }

    pub fn study_session_data(&self) -> String {
        self.run("studySessionData").into()
    }

    pub fn group_reassign(&self) -> String {
        self.run("group/reassign").into()
    }

    pub fn group_leave(&self) -> String {
        self.run("group/leave").into()
    }

    pub fn start_component(&self, component_id: &str, message: Option<&str>) -> String {
        let mut url = self.run(&format!("{component_id}/start"));
        if let Some(message) = message {
            url.query_pairs_mut().append_pair("message", message);
        }
        url.into()
    }

    pub fn end(&self, successful: bool, message: Option<&str>) -> String {
        let mut url = self.run("end");
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("successful", if successful { "true" } else { "false" });
            if let Some(message) = message {
                query.append_pair("message", message);
            }
        }
        url.into()
    }

    pub fn abort(&self, message: Option<&str>) -> String {
        let mut url = self.run("abort");
        if let Some(message) = message {
            url.query_pairs_mut().append_pair("message", message);
        }
        url.into()
    }

    /// WebSocket endpoint of a channel: `http` becomes `ws`, `https` `wss`.
    pub fn channel(&self, kind: ChannelKind) -> StudyResult<String> {
        let mut url = self.run(kind.endpoint());
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| StudyError::Url(format!("cannot switch {url} to {scheme}")))?;
        Ok(url.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_component_url_with_prefix() {
        let urls = RunUrls::from_component_url(
            "https://studies.example.org/lab/publix/abc123/comp-9/start?srid=1#top",
        )
        .expect("valid component url");

        assert_eq!(urls.run_id(), "abc123");
        assert_eq!(urls.component_id(), "comp-9");
        assert_eq!(
            urls.init_data(),
            "https://studies.example.org/lab/publix/abc123/comp-9/initData"
        );
        assert_eq!(
            urls.heartbeat(),
            "https://studies.example.org/lab/publix/abc123/heartbeat"
        );
        assert_eq!(
            urls.channel(ChannelKind::Batch).expect("ws url"),
            "wss://studies.example.org/lab/publix/abc123/batch/open"
        );
    }

    #[test]
    fn builds_lifecycle_urls_with_encoded_queries() {
        let urls = RunUrls::new("http://localhost:9000", "r1", "c1").expect("urls");
        assert_eq!(
            urls.end(false, Some("too slow & tired")),
            "http://localhost:9000/publix/r1/end?successful=false&message=too+slow+%26+tired"
        );
        assert_eq!(urls.abort(None), "http://localhost:9000/publix/r1/abort");
        assert_eq!(
            urls.start_component("c2", Some("hi")),
            "http://localhost:9000/publix/r1/c2/start?message=hi"
        );
        assert_eq!(
            urls.channel(ChannelKind::Group).expect("ws url"),
            "ws://localhost:9000/publix/r1/group/join"
        );
        assert_eq!(
            urls.file("my data.csv"),
            "http://localhost:9000/publix/r1/c1/files/my%20data.csv"
        );
        assert_eq!(
            urls.file_download("a.txt", Some("c0")),
            "http://localhost:9000/publix/r1/c1/files/a.txt?componentId=c0"
        );
    }

    #[test]
    fn rejects_urls_without_a_run() {
        assert!(RunUrls::from_component_url("http://h/somewhere/else").is_err());
        assert!(RunUrls::from_component_url("http://h/publix/").is_err());
    }
}
