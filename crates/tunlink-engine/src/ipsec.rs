//! IPsec daemon configuration
//!
//! Each state becomes one `<state id>.conf` file under the managed directory
//! holding a `conn` block per link. All pre-shared keys go into a single
//! secrets file. The main `ipsec.conf` only needs an `include` of the
//! managed directory, which is added once and otherwise left alone.

use crate::error::{LinkError, LinkResult};
use crate::host::run_cmd;
use std::fs;
use std::path::{Path, PathBuf};
use tunlink_protocol::{Link, State};

/// Values substituted into the per-link templates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTemplate {
    /// Connection name, `<state id>-<link index>`
    pub id: String,
    /// Public address of this host
    pub left: String,
    /// Local subnets, comma separated
    pub left_subnets: String,
    /// Remote endpoint
    pub right: String,
    /// Remote subnets, comma separated
    pub right_subnets: String,
    /// Pre-shared key
    pub pre_shared_key: String,
}

impl LinkTemplate {
    /// Template values for link `index` of `state`
    pub fn new(state: &State, index: usize, link: &Link, public_address: &str) -> Self {
        Self {
            id: state.link_id(index),
            left: public_address.to_string(),
            left_subnets: link.left_subnets.join(","),
            right: link.right.clone(),
            right_subnets: link.right_subnets.join(","),
            pre_shared_key: link.pre_shared_key.clone(),
        }
    }
}

/// Render the `conn` block for one link
pub fn render_conf(data: &LinkTemplate) -> LinkResult<String> {
    for (field, value) in [
        ("id", &data.id),
        ("right", &data.right),
        ("left_subnets", &data.left_subnets),
        ("right_subnets", &data.right_subnets),
    ] {
        if value.contains(char::is_whitespace) {
            return Err(LinkError::parse(
                "ipsec: Failed to execute conf template",
                format!("{} of {} contains whitespace", field, data.id),
            ));
        }
    }

    Ok(format!(
        "conn {id}
\tikelifetime=8h
\tkeylife=1h
\trekeymargin=9m
\tkeyingtries=%forever
\tauthby=secret
\tkeyexchange=ikev2
\tmobike=no
\tdpddelay=5s
\tdpdtimeout=20s
\tdpdaction=restart
\tleft=%defaultroute
\tleftid={left}
\tleftsubnet={left_subnets}
\tright={right}
\trightid={right}
\trightsubnet={right_subnets}
\tauto=start

",
        id = data.id,
        left = data.left,
        left_subnets = data.left_subnets,
        right = data.right,
        right_subnets = data.right_subnets,
    ))
}

/// Render the secrets line for one link
pub fn render_secrets(data: &LinkTemplate) -> LinkResult<String> {
    if data.pre_shared_key.contains(['"', '\n', '\r']) {
        return Err(LinkError::parse(
            "ipsec: Failed to execute secrets template",
            format!("pre-shared key of {} contains a quote or line break", data.id),
        ));
    }
    Ok(format!(
        "{} {} : PSK \"{}\"\n",
        data.left, data.right, data.pre_shared_key
    ))
}

/// Rendered files for a set of states
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedConfig {
    /// `(state id, conf contents)` in state order
    pub confs: Vec<(String, String)>,
    /// Secrets file contents
    pub secrets: String,
}

/// Render every state against `public_address`
pub fn render_states(states: &[State], public_address: &str) -> LinkResult<RenderedConfig> {
    let mut rendered = RenderedConfig::default();
    for state in states {
        // The id names a file under the managed directory
        if state.id.contains(['/', '\\']) || state.id.contains("..") {
            return Err(LinkError::parse(
                "ipsec: Failed to execute conf template",
                format!("state id '{}' is not a valid file name", state.id),
            ));
        }
        let mut conf = String::new();
        for (i, link) in state.links.iter().enumerate() {
            let data = LinkTemplate::new(state, i, link, public_address);
            conf.push_str(&render_conf(&data)?);
            rendered.secrets.push_str(&render_secrets(&data)?);
        }
        rendered.confs.push((state.id.clone(), conf));
    }
    Ok(rendered)
}

/// Writes rendered configuration to the filesystem
#[derive(Debug, Clone)]
pub struct IpsecConfigWriter {
    dir: PathBuf,
    conf_path: PathBuf,
    secrets_path: PathBuf,
}

impl IpsecConfigWriter {
    /// Writer for a managed directory, main conf and secrets file
    pub fn new<P: Into<PathBuf>>(dir: P, conf_path: P, secrets_path: P) -> Self {
        Self {
            dir: dir.into(),
            conf_path: conf_path.into(),
            secrets_path: secrets_path.into(),
        }
    }

    /// Managed directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The line the main conf must contain
    pub fn include_line(&self) -> String {
        format!("include {}/*.conf", self.dir.display())
    }

    /// Remove and recreate the managed directory
    pub fn clear_dir(&self) -> LinkResult<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(LinkError::write("ipsec: Failed to remove ipsec conf dir", e)),
        }
        fs::create_dir_all(&self.dir)
            .map_err(|e| LinkError::write("ipsec: Failed to create ipsec conf dir", e))
    }

    /// Make sure the main conf includes the managed directory
    pub fn write_conf(&self) -> LinkResult<()> {
        let include = self.include_line();
        if let Ok(current) = fs::read_to_string(&self.conf_path) {
            if current.contains(&include) {
                return Ok(());
            }
        }
        fs::write(&self.conf_path, format!("{}\n", include))
            .map_err(|e| LinkError::write("ipsec: Failed to write conf", e))
    }

    /// Write per-state confs and the secrets file
    pub fn write_rendered(&self, rendered: &RenderedConfig) -> LinkResult<()> {
        for (id, conf) in &rendered.confs {
            let path = self.dir.join(format!("{}.conf", id));
            fs::write(&path, conf)
                .map_err(|e| LinkError::write("ipsec: Failed to write state conf", e))?;
        }
        write_secret_file(&self.secrets_path, &rendered.secrets)
            .map_err(|e| LinkError::write("ipsec: Failed to write state secrets", e))
    }
}

#[cfg(unix)]
fn write_secret_file(path: &Path, contents: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // mode() only applies on create
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    file.write_all(contents.as_bytes())
}

#[cfg(not(unix))]
fn write_secret_file(path: &Path, contents: &str) -> std::io::Result<()> {
    fs::write(path, contents)
}

/// Controls the IPsec daemon
pub trait DaemonController: Send + Sync {
    /// Restart the daemon so it picks up new configuration
    fn restart(&self) -> LinkResult<()>;
}

/// Restarts the daemon with `ipsec restart`
#[derive(Debug, Clone, Default)]
pub struct IpsecCtl;

impl DaemonController for IpsecCtl {
    fn restart(&self) -> LinkResult<()> {
        run_cmd("ipsec", &["restart"])
            .map_err(|e| LinkError::exec("ipsec: Failed to restart daemon", e))?;
        tracing::info!("Restarted ipsec daemon");
        Ok(())
    }
}
