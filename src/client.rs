use crate::auth::AdbKeyPair;
use crate::config::AdbConfig;
use crate::connection::AdbConnection;
use crate::protocol::AdbError;
use std::sync::Arc;

/// Run one shell command and return the first chunk of output.
///
/// One `read()` is enough for commands like `am force-stop`, which print
/// little or nothing before adbd closes the stream. A stream closed without
/// output counts as success and yields an empty buffer.
pub fn run_shell_command(connection: &AdbConnection, command: &str) -> Result<Vec<u8>, AdbError> {
    let stream = connection.open(&format!("shell:{}", command))?;

    let output = match stream.read() {
        Ok(data) => data,
        Err(AdbError::StreamClosed) => Vec::new(),
        Err(e) => {
            let _ = stream.close();
            return Err(e);
        }
    };

    stream.close()?;
    Ok(output)
}

/// Run a shell command and collect everything it prints until adbd closes
/// the stream.
pub fn shell(connection: &AdbConnection, command: &str) -> Result<Vec<u8>, AdbError> {
    let stream = connection.open(&format!("shell:{}", command))?;
    let mut output = Vec::new();

    loop {
        match stream.read() {
            Ok(data) => output.extend_from_slice(&data),
            Err(AdbError::StreamClosed) => break,
            Err(e) => {
                let _ = stream.close();
                return Err(e);
            }
        }
    }

    stream.close()?;
    Ok(output)
}

/// `am force-stop` every target over one shared connection. Returns how
/// many commands completed; a failing target is logged and skipped.
pub fn force_stop_packages<I, S>(connection: &AdbConnection, packages: I) -> usize
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut count = 0;

    for package in packages {
        let package = package.as_ref();
        match run_shell_command(connection, &format!("am force-stop {}", package)) {
            Ok(output) => {
                let output = String::from_utf8_lossy(&output);
                let output = output.trim();
                if !output.is_empty() {
                    log::debug!("force-stop {}: {}", package, output);
                }
                log::info!("Force-stopped {}", package);
                count += 1;
            }
            Err(e) => {
                log::warn!("Failed to force-stop {}: {}", package, e);
            }
        }
    }

    count
}

/// Dial adbd and finish the handshake
pub fn connect(config: &AdbConfig, keypair: Arc<AdbKeyPair>) -> Result<AdbConnection, AdbError> {
    let connection = AdbConnection::dial(config, keypair)?;
    connection.connect()?;
    log::info!("Connected to adbd at {}:{}", config.host, config.port);
    Ok(connection)
}

/// Check that adbd is reachable, authorizes our key, and runs commands.
pub fn test_connection(config: &AdbConfig, keypair: Arc<AdbKeyPair>) -> bool {
    let connection = match connect(config, keypair) {
        Ok(connection) => connection,
        Err(e) => {
            log::warn!("ADB connection test failed: {}", e);
            return false;
        }
    };

    match run_shell_command(&connection, "echo adb_ok") {
        Ok(output) if output.is_empty() => true,
        Ok(output) => {
            let output = String::from_utf8_lossy(&output);
            log::info!("ADB connection test output: {}", output.trim());
            output.contains("adb_ok")
        }
        Err(e) => {
            log::warn!("ADB connection test failed: {}", e);
            false
        }
    }
}

/// Weaker way to stop a target, used when adbd cannot be reached at all.
pub trait Fallback: Send + Sync {
    fn stop(&self, package: &str) -> Result<(), AdbError>;
}

/// Stops named targets through adbd's shell, falling back to a
/// caller-provided mechanism when the transport is unavailable.
pub struct AppKiller {
    config: AdbConfig,
    keypair: Arc<AdbKeyPair>,
    fallback: Option<Box<dyn Fallback>>,
}

impl AppKiller {
    pub fn new(config: AdbConfig, keypair: Arc<AdbKeyPair>) -> Self {
        Self {
            config,
            keypair,
            fallback: None,
        }
    }

    /// Load or create the key pair named in `config`
    pub fn from_config(config: AdbConfig) -> Result<Self, AdbError> {
        let keypair =
            AdbKeyPair::load_or_generate(&config.private_key_path, &config.public_key_path)?;
        Ok(Self::new(config, Arc::new(keypair)))
    }

    pub fn with_fallback(mut self, fallback: Box<dyn Fallback>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Force-stop over ADB only. Transport failure is reported as zero.
    pub fn force_stop_apps<I, S>(&self, packages: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let connection = match connect(&self.config, Arc::clone(&self.keypair)) {
            Ok(connection) => connection,
            Err(e) => {
                log::error!(
                    "ADB connection to {}:{} failed: {} (is wireless debugging on and this key authorized?)",
                    self.config.host,
                    self.config.port,
                    e
                );
                return 0;
            }
        };

        let count = force_stop_packages(&connection, packages);
        connection.close();
        count
    }

    /// Stop every target, preferring ADB. When ADB stops nothing, each
    /// target goes through the fallback instead.
    pub fn kill_apps(&self, packages: &[String]) -> usize {
        if packages.is_empty() {
            log::info!("No apps to stop");
            return 0;
        }

        log::info!("Stopping {} apps", packages.len());
        let count = self.force_stop_apps(packages);
        if count > 0 {
            log::info!("ADB force-stopped {} / {} apps", count, packages.len());
            return count;
        }

        let Some(fallback) = &self.fallback else {
            log::warn!("ADB force-stop failed and no fallback is configured");
            return 0;
        };

        log::warn!("ADB force-stop failed, using fallback");
        let mut count = 0;
        for package in packages {
            match fallback.stop(package) {
                Ok(()) => {
                    log::info!("[fallback] stopped {}", package);
                    count += 1;
                }
                Err(e) => log::warn!("[fallback] failed for {}: {}", package, e),
            }
        }
        count
    }

    pub fn test_connection(&self) -> bool {
        test_connection(&self.config, Arc::clone(&self.keypair))
    }

    pub fn keypair(&self) -> &AdbKeyPair {
        &self.keypair
    }
}
