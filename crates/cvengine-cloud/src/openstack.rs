use crate::{
    CloudApi, CloudError, CloudProvider, CloudResource, FloatingIp, Port, ServerRequest,
    ServerStatus,
};
use cvengine_schema::OpenStackAuth;
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::Read;
use std::time::Duration;
use tracing::debug;

type HttpResult = Result<ureq::http::Response<ureq::Body>, ureq::Error>;

/// OpenStack over its REST APIs: Keystone v3 password auth, then Nova,
/// Glance and Neutron public endpoints from the service catalog.
pub struct OpenStackProvider {
    timeout: Duration,
}

impl Default for OpenStackProvider {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
        }
    }
}

impl OpenStackProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CloudProvider for OpenStackProvider {
    fn name(&self) -> &'static str {
        "openstack"
    }

    fn open_session(&self, auth: &OpenStackAuth) -> Result<Box<dyn CloudApi>, CloudError> {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(self.timeout))
            .build();
        let agent = ureq::Agent::new_with_config(config);
        let session = OpenStackSession::authenticate(agent, auth)?;
        Ok(Box::new(session))
    }
}

#[derive(Debug, Deserialize)]
struct TokenEnvelope {
    token: TokenBody,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    project: Option<ProjectRef>,
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct ProjectRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<Endpoint>,
}

#[derive(Debug, Deserialize)]
struct Endpoint {
    interface: String,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    region_id: Option<String>,
    url: String,
}

struct OpenStackSession {
    agent: ureq::Agent,
    token: String,
    tenant_id: String,
    compute: String,
    image: String,
    network: String,
}

fn identity_url(auth_url: &str) -> String {
    let base = auth_url.trim_end_matches('/');
    if base.ends_with("/v3") {
        format!("{base}/auth/tokens")
    } else {
        format!("{base}/v3/auth/tokens")
    }
}

fn public_endpoint(
    catalog: &[CatalogEntry],
    service_type: &str,
    region: &str,
) -> Result<String, CloudError> {
    let entry = catalog
        .iter()
        .find(|e| e.service_type == service_type)
        .ok_or_else(|| CloudError::MissingService(service_type.to_owned()))?;
    let in_region = |ep: &&Endpoint| {
        ep.region.as_deref() == Some(region) || ep.region_id.as_deref() == Some(region)
    };
    entry
        .endpoints
        .iter()
        .filter(|ep| ep.interface == "public")
        .find(in_region)
        .or_else(|| entry.endpoints.iter().find(|ep| ep.interface == "public"))
        .map(|ep| ep.url.trim_end_matches('/').to_owned())
        .ok_or_else(|| CloudError::MissingService(format!("{service_type} (public)")))
}

fn read_body(resp: ureq::http::Response<ureq::Body>) -> Result<Value, CloudError> {
    let mut reader = resp.into_body().into_reader();
    let mut body = Vec::new();
    reader
        .read_to_end(&mut body)
        .map_err(|e| CloudError::Http(e.to_string()))?;
    if body.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&body).map_err(|e| CloudError::Serialization(e.to_string()))
}

fn check(
    result: HttpResult,
    what: &str,
) -> Result<ureq::http::Response<ureq::Body>, CloudError> {
    match result {
        Ok(resp) => Ok(resp),
        Err(ureq::Error::StatusCode(code)) => {
            Err(CloudError::Http(format!("HTTP {code} for {what}")))
        }
        Err(e) => Err(CloudError::Http(format!("{what}: {e}"))),
    }
}

fn extract<T: serde::de::DeserializeOwned>(mut value: Value, key: &str) -> Result<T, CloudError> {
    let inner = value
        .get_mut(key)
        .map(Value::take)
        .ok_or_else(|| CloudError::Serialization(format!("missing '{key}' in response")))?;
    serde_json::from_value(inner).map_err(|e| CloudError::Serialization(e.to_string()))
}

fn first_named(
    items: Vec<CloudResource>,
    kind: &'static str,
    name: &str,
) -> Result<CloudResource, CloudError> {
    items
        .into_iter()
        .find(|r| r.name == name || r.id == name)
        .ok_or_else(|| CloudError::NotFound {
            kind,
            name: name.to_owned(),
        })
}

impl OpenStackSession {
    fn authenticate(agent: ureq::Agent, auth: &OpenStackAuth) -> Result<Self, CloudError> {
        let domain = auth.domain.as_deref().unwrap_or("Default");
        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": auth.username,
                            "domain": {"name": domain},
                            "password": auth.password,
                        }
                    }
                },
                "scope": {
                    "project": {"name": auth.project, "domain": {"name": domain}}
                }
            }
        });
        let url = identity_url(&auth.auth_url);
        debug!("POST {url} (user {}, project {})", auth.username, auth.project);
        let payload =
            serde_json::to_vec(&body).map_err(|e| CloudError::Serialization(e.to_string()))?;
        let resp = match agent
            .post(&url)
            .header("Content-Type", "application/json")
            .send(&payload[..])
        {
            Ok(r) => r,
            Err(ureq::Error::StatusCode(401)) => {
                return Err(CloudError::Auth(format!(
                    "credentials rejected for user '{}'",
                    auth.username
                )));
            }
            Err(ureq::Error::StatusCode(code)) => {
                return Err(CloudError::Auth(format!("HTTP {code} from {url}")));
            }
            Err(e) => return Err(CloudError::Auth(format!("{url}: {e}"))),
        };
        let token = resp
            .headers()
            .get("X-Subject-Token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| CloudError::Auth("no X-Subject-Token in response".to_owned()))?;
        let envelope: TokenEnvelope = serde_json::from_value(read_body(resp)?)
            .map_err(|e| CloudError::Serialization(e.to_string()))?;
        let tenant_id = envelope
            .token
            .project
            .map(|p| p.id)
            .ok_or_else(|| CloudError::Auth("token is not project-scoped".to_owned()))?;
        let catalog = &envelope.token.catalog;
        Ok(Self {
            compute: public_endpoint(catalog, "compute", &auth.region)?,
            image: public_endpoint(catalog, "image", &auth.region)?,
            network: public_endpoint(catalog, "network", &auth.region)?,
            agent,
            token,
            tenant_id,
        })
    }

    fn get(&self, url: &str, query: &[(&str, &str)]) -> Result<Value, CloudError> {
        debug!("GET {url} {query:?}");
        let mut req = self.agent.get(url).header("X-Auth-Token", &self.token);
        for (k, v) in query {
            req = req.query(*k, *v);
        }
        read_body(check(req.call(), url)?)
    }

    fn send(&self, method: &str, url: &str, body: &Value) -> Result<Value, CloudError> {
        debug!("{method} {url}");
        let payload =
            serde_json::to_vec(body).map_err(|e| CloudError::Serialization(e.to_string()))?;
        let req = match method {
            "PUT" => self.agent.put(url),
            _ => self.agent.post(url),
        };
        let result = req
            .header("X-Auth-Token", &self.token)
            .header("Content-Type", "application/json")
            .send(&payload[..]);
        read_body(check(result, url)?)
    }

    fn delete(&self, url: &str, kind: &'static str, id: &str) -> Result<(), CloudError> {
        debug!("DELETE {url}");
        match self.agent.delete(url).header("X-Auth-Token", &self.token).call() {
            Ok(_) => Ok(()),
            Err(ureq::Error::StatusCode(404)) => Err(CloudError::NotFound {
                kind,
                name: id.to_owned(),
            }),
            Err(e) => check(Err(e), url).map(|_| ()),
        }
    }
}

impl CloudApi for OpenStackSession {
    fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    fn find_image(&self, name: &str) -> Result<CloudResource, CloudError> {
        let value = self.get(&format!("{}/v2/images", self.image), &[("name", name)])?;
        first_named(extract(value, "images")?, "image", name)
    }

    fn find_flavor(&self, name: &str) -> Result<CloudResource, CloudError> {
        let value = self.get(&format!("{}/flavors/detail", self.compute), &[])?;
        first_named(extract(value, "flavors")?, "flavor", name)
    }

    fn find_network(&self, name: &str) -> Result<CloudResource, CloudError> {
        let value = self.get(&format!("{}/v2.0/networks", self.network), &[("name", name)])?;
        first_named(extract(value, "networks")?, "network", name)
    }

    fn find_keypair(&self, name: &str) -> Result<CloudResource, CloudError> {
        #[derive(Deserialize)]
        struct Keypair {
            name: String,
        }
        let url = format!("{}/os-keypairs/{name}", self.compute);
        let keypair: Keypair = match self.get(&url, &[]) {
            Ok(value) => extract(value, "keypair")?,
            Err(CloudError::Http(msg)) if msg.starts_with("HTTP 404") => {
                return Err(CloudError::NotFound {
                    kind: "keypair",
                    name: name.to_owned(),
                })
            }
            Err(e) => return Err(e),
        };
        Ok(CloudResource {
            id: keypair.name.clone(),
            name: keypair.name,
        })
    }

    fn create_server(&self, request: &ServerRequest) -> Result<String, CloudError> {
        #[derive(Deserialize)]
        struct Created {
            id: String,
        }
        let body = json!({
            "server": {
                "name": request.name,
                "imageRef": request.image_id,
                "flavorRef": request.flavor_id,
                "networks": [{"uuid": request.network_id}],
                "key_name": request.key_name,
                "user_data": request.user_data,
            }
        });
        let value = self.send("POST", &format!("{}/servers", self.compute), &body)?;
        let created: Created = extract(value, "server")?;
        Ok(created.id)
    }

    fn server_status(&self, server_id: &str) -> Result<ServerStatus, CloudError> {
        let value = self.get(&format!("{}/servers/{server_id}", self.compute), &[])?;
        let server = value
            .get("server")
            .ok_or_else(|| CloudError::Serialization("missing 'server' in response".to_owned()))?;
        let status = server.get("status").and_then(Value::as_str).unwrap_or("UNKNOWN");
        let fault = server
            .get("fault")
            .and_then(|f| f.get("message"))
            .and_then(Value::as_str);
        Ok(ServerStatus::parse(status, fault))
    }

    fn delete_server(&self, server_id: &str) -> Result<(), CloudError> {
        self.delete(
            &format!("{}/servers/{server_id}", self.compute),
            "server",
            server_id,
        )
    }

    fn list_ports(&self, device_id: &str) -> Result<Vec<Port>, CloudError> {
        let value = self.get(
            &format!("{}/v2.0/ports", self.network),
            &[("device_id", device_id)],
        )?;
        extract(value, "ports")
    }

    fn list_floating_ips(&self, network_id: &str) -> Result<Vec<FloatingIp>, CloudError> {
        let value = self.get(
            &format!("{}/v2.0/floatingips", self.network),
            &[("floating_network_id", network_id)],
        )?;
        extract(value, "floatingips")
    }

    fn create_floating_ip(
        &self,
        network_id: &str,
        port_id: &str,
    ) -> Result<FloatingIp, CloudError> {
        let body = json!({"floatingip": {"floating_network_id": network_id, "port_id": port_id}});
        let value = self.send("POST", &format!("{}/v2.0/floatingips", self.network), &body)?;
        extract(value, "floatingip")
    }

    fn attach_floating_ip(
        &self,
        floating_ip_id: &str,
        port_id: &str,
    ) -> Result<FloatingIp, CloudError> {
        let body = json!({"floatingip": {"port_id": port_id}});
        let value = self.send(
            "PUT",
            &format!("{}/v2.0/floatingips/{floating_ip_id}", self.network),
            &body,
        )?;
        extract(value, "floatingip")
    }

    fn delete_floating_ip(&self, floating_ip_id: &str) -> Result<(), CloudError> {
        self.delete(
            &format!("{}/v2.0/floatingips/{floating_ip_id}", self.network),
            "floating ip",
            floating_ip_id,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};

    /// Minimal OpenStack: keystone, one image, one network, echoing creates.
    struct FakeOpenStack {
        base: String,
        requests: Arc<Mutex<Vec<(String, String, HashMap<String, String>)>>>,
    }

    impl FakeOpenStack {
        fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let base = format!("http://{}", listener.local_addr().unwrap());
            let requests = Arc::new(Mutex::new(Vec::new()));
            let reqs = Arc::clone(&requests);
            let catalog_base = base.clone();
            std::thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(mut stream) = stream else { break };
                    let mut reader = BufReader::new(stream.try_clone().unwrap());
                    let mut request_line = String::new();
                    if reader.read_line(&mut request_line).is_err() {
                        continue;
                    }
                    let parts: Vec<&str> = request_line.trim().splitn(3, ' ').collect();
                    let method = parts[0].to_owned();
                    let path = parts[1].to_owned();
                    let mut headers = HashMap::new();
                    let mut content_length = 0usize;
                    loop {
                        let mut line = String::new();
                        if reader.read_line(&mut line).is_err() || line.trim().is_empty() {
                            break;
                        }
                        if let Some((k, v)) = line.trim().split_once(": ") {
                            let k = k.to_lowercase();
                            if k == "content-length" {
                                content_length = v.parse().unwrap_or(0);
                            }
                            headers.insert(k, v.to_owned());
                        }
                    }
                    let mut body = vec![0u8; content_length];
                    if content_length > 0 {
                        let _ = reader.read_exact(&mut body);
                    }
                    reqs.lock().unwrap().push((method.clone(), path.clone(), headers));

                    let (status, extra, payload) = route(&method, &path, &catalog_base);
                    let response = format!(
                        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\n{extra}\
                         Content-Length: {}\r\nConnection: close\r\n\r\n{payload}",
                        payload.len()
                    );
                    let _ = stream.write_all(response.as_bytes());
                    let _ = stream.flush();
                }
            });
            Self { base, requests }
        }
    }

    fn route(method: &str, path: &str, base: &str) -> (&'static str, String, String) {
        match (method, path.split('?').next().unwrap_or(path)) {
            ("POST", "/identity/v3/auth/tokens") => (
                "201 Created",
                "X-Subject-Token: tok-123\r\n".to_owned(),
                json!({"token": {
                    "project": {"id": "tenant-1"},
                    "catalog": [
                        {"type": "compute", "endpoints": [
                            {"interface": "internal", "region": "RegionOne",
                             "url": "http://internal"},
                            {"interface": "public", "region": "RegionOne",
                             "url": format!("{base}/compute/v2.1/")}
                        ]},
                        {"type": "image", "endpoints": [
                            {"interface": "public", "region": "RegionOne",
                             "url": format!("{base}/image")}
                        ]},
                        {"type": "network", "endpoints": [
                            {"interface": "public", "region_id": "RegionOne",
                             "url": format!("{base}/network")}
                        ]}
                    ]
                }})
                .to_string(),
            ),
            ("GET", "/image/v2/images") => (
                "200 OK",
                String::new(),
                json!({"images": [{"id": "img-1", "name": "fedora-28"}]}).to_string(),
            ),
            ("GET", "/network/v2.0/floatingips") => (
                "200 OK",
                String::new(),
                json!({"floatingips": [
                    {"id": "f1", "floating_ip_address": "172.24.4.9", "port_id": null,
                     "tenant_id": "tenant-1", "floating_network_id": "ext"}
                ]})
                .to_string(),
            ),
            ("POST", "/compute/v2.1/servers") => (
                "202 Accepted",
                String::new(),
                json!({"server": {"id": "srv-1"}}).to_string(),
            ),
            ("GET", "/compute/v2.1/servers/srv-1") => (
                "200 OK",
                String::new(),
                json!({"server": {"id": "srv-1", "status": "ACTIVE"}}).to_string(),
            ),
            ("DELETE", "/compute/v2.1/servers/srv-1") => {
                ("204 No Content", String::new(), String::new())
            }
            _ => ("404 Not Found", String::new(), "{}".to_owned()),
        }
    }

    fn auth(base: &str) -> OpenStackAuth {
        OpenStackAuth {
            auth_url: format!("{base}/identity"),
            project: "cv".to_owned(),
            username: "bot".to_owned(),
            password: "pw".to_owned(),
            region: "RegionOne".to_owned(),
            domain: None,
        }
    }

    #[test]
    fn identity_url_appends_version() {
        assert_eq!(identity_url("http://k:5000"), "http://k:5000/v3/auth/tokens");
        assert_eq!(identity_url("http://k:5000/v3/"), "http://k:5000/v3/auth/tokens");
    }

    #[test]
    fn session_uses_public_endpoints_and_token() {
        let fake = FakeOpenStack::start();
        let api = OpenStackProvider::new().open_session(&auth(&fake.base)).unwrap();
        assert_eq!(api.tenant_id(), "tenant-1");

        let image = api.find_image("fedora-28").unwrap();
        assert_eq!(image.id, "img-1");

        let fips = api.list_floating_ips("ext").unwrap();
        assert_eq!(fips.len(), 1);
        assert!(fips[0].port_id.is_none());

        let id = api
            .create_server(&ServerRequest {
                name: "cvhost-x".to_owned(),
                image_id: "img-1".to_owned(),
                flavor_id: "fl".to_owned(),
                network_id: "net".to_owned(),
                key_name: "key".to_owned(),
                user_data: "e30=".to_owned(),
            })
            .unwrap();
        assert_eq!(id, "srv-1");
        assert_eq!(api.server_status(&id).unwrap(), ServerStatus::Active);
        api.delete_server(&id).unwrap();

        let reqs = fake.requests.lock().unwrap().clone();
        let authed: Vec<_> = reqs.iter().filter(|(_, p, _)| !p.contains("auth/tokens")).collect();
        assert!(authed
            .iter()
            .all(|(_, _, h)| h.get("x-auth-token").map(String::as_str) == Some("tok-123")));
        assert!(reqs
            .iter()
            .any(|(m, p, _)| m == "GET" && p.contains("floating_network_id=ext")));
    }

    #[test]
    fn missing_image_is_not_found() {
        let fake = FakeOpenStack::start();
        let api = OpenStackProvider::new().open_session(&auth(&fake.base)).unwrap();
        let err = api.find_image("rhel").unwrap_err();
        assert!(matches!(err, CloudError::NotFound { kind: "image", .. }));
    }

    #[test]
    fn bad_identity_endpoint_is_auth_error() {
        let fake = FakeOpenStack::start();
        let mut a = auth(&fake.base);
        a.auth_url = format!("{}/elsewhere", fake.base);
        let err = OpenStackProvider::new().open_session(&a).err().unwrap();
        assert!(matches!(err, CloudError::Auth(_)));
    }
}
