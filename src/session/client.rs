use super::*;

/// Client-side hello sent after the subsystem opens.
const CLIENT_HELLO: &str = "<hello><capabilities>\
<capability>urn:ietf:params:netconf:base:1.0</capability>\
</capabilities></hello>";

impl Session {
    /// Opens one authenticated session and probes the device identity.
    ///
    /// Authentication uses exactly one of password, in-memory key, or key
    /// file (see [`ConnectOptions`]); the whole open sequence is bounded
    /// by `connect_timeout`. A device that answers but reports no
    /// hardware model is rejected: higher layers cannot operate on an
    /// unidentified device.
    pub async fn open(opts: ConnectOptions) -> Result<Session, ConfigError> {
        let device_addr = opts.device_addr();
        let auth = opts.auth_method()?;

        let config = Config {
            preferred: opts.security.preferred(),
            // Long-running commit and lock waits are bounded only by
            // caller cancellation, never by transport inactivity.
            inactivity_timeout: None,
            ..Default::default()
        };

        let connect = Client::connect_with_config(
            (opts.addr.clone(), opts.port),
            &opts.username,
            auth,
            opts.security.server_check.clone(),
            config,
        );
        let client = match tokio::time::timeout(opts.connect_timeout, connect).await {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => {
                return Err(ConfigError::Connect {
                    addr: device_addr,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(ConfigError::Connect {
                    addr: device_addr,
                    reason: format!("timeout after {:?}", opts.connect_timeout),
                });
            }
        };
        debug!("{} TCP connection successful", device_addr);

        let mut channel = client.get_channel().await?;
        channel.request_subsystem(true, "netconf").await?;
        debug!("{} management subsystem open", device_addr);

        let (sender_to_remote, mut receiver_from_session) = mpsc::channel::<String>(256);
        let (sender_to_session, receiver_from_remote) = mpsc::channel::<String>(256);

        let io_task_device_addr = device_addr.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(data) = receiver_from_session.recv() => {
                        if let Err(e) = channel.data(data.as_bytes()).await {
                            debug!("{} failed to send data: {:?}", io_task_device_addr, e);
                            break;
                        }
                    },
                    Some(msg) = channel.wait() => {
                        match msg {
                            ChannelMsg::Data { ref data } => {
                                if let Ok(s) = std::str::from_utf8(data)
                                    && sender_to_session.send(s.to_string()).await.is_err() {
                                        debug!("{} reply receiver dropped. Closing task.", io_task_device_addr);
                                        break;
                                    }
                            }
                            ChannelMsg::ExitStatus { exit_status } => {
                                debug!("{} subsystem exited with status {}", io_task_device_addr, exit_status);
                                let _ = channel.eof().await;
                                break;
                            }
                            ChannelMsg::Eof => {
                                debug!("{} remote sent EOF.", io_task_device_addr);
                                break;
                            }
                            _ => {}
                        }
                    }
                }
            }
            debug!("{} session I/O task ended.", io_task_device_addr);
        });

        let mut session = Session {
            client,
            sender: sender_to_remote,
            recv: receiver_from_remote,
            identity: DeviceIdentity {
                model: String::new(),
                hostname: None,
                os_name: None,
                os_version: None,
                serial: None,
            },
            device_addr: device_addr.clone(),
            tunables: opts.tunables,
            oplog: opts.oplog,
        };

        // Hello exchange plus identity probe, bounded by the same
        // connect timeout. Everything after this point is unbounded.
        let init = tokio::time::timeout(opts.connect_timeout, async {
            let server_hello = session.read_reply().await?;
            trace!("{} server hello: {:?}", session.device_addr, server_hello);
            session
                .sender
                .send(format!("{CLIENT_HELLO}\n{MESSAGE_DELIMITER}\n"))
                .await?;

            let reply = session.rpc(SYSTEM_INFORMATION_RPC).await?;
            parse_identity(&reply).ok_or(ConfigError::Identity {
                addr: session.device_addr.clone(),
            })
        })
        .await;

        match init {
            Ok(Ok(identity)) => {
                debug!(
                    "{} identified as {} ({})",
                    device_addr,
                    identity.model,
                    identity.hostname.as_deref().unwrap_or("unknown host")
                );
                session.identity = identity;
                Ok(session)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ConfigError::InitTimeout(
                "waiting for hello and identity".to_string(),
            )),
        }
    }

    /// Negotiated identity of the connected device.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// `user@host:port` label of this session.
    pub fn device_addr(&self) -> &str {
        &self.device_addr
    }

    /// Checks if the underlying SSH connection is still active.
    pub fn is_connected(&self) -> bool {
        !self.client.is_closed()
    }

    /// Closes the transport.
    ///
    /// Close-time failures are logged, never propagated: once all other
    /// work is done there is nothing a caller could do about them. The
    /// drain delay gives the remote side time to tear down cleanly
    /// before the socket is released.
    pub async fn close(mut self) -> CleanupOutcome {
        debug!("{} closing session...", self.device_addr);
        if let Some(oplog) = self.oplog.as_ref() {
            let _ = oplog.record("session close");
        }

        let mut failure = None;
        if self.is_connected() {
            if let Err(e) = self
                .sender
                .send(format!(
                    "<rpc>{CLOSE_RPC}</rpc>\n{MESSAGE_DELIMITER}\n"
                ))
                .await
            {
                debug!("{} failed to send close rpc: {:?}", self.device_addr, e);
                failure = Some(format!("close rpc not sent: {e}"));
            }
            tokio::time::sleep(self.tunables.drain_delay).await;
        }

        self.recv.close();
        if let Err(e) = self.client.disconnect().await {
            debug!("{} disconnect error: {:?}", self.device_addr, e);
            failure.get_or_insert_with(|| format!("disconnect failed: {e}"));
        }

        debug!("{} session closed", self.device_addr);
        match failure {
            None => CleanupOutcome::Clean,
            Some(detail) => CleanupOutcome::Failed(detail),
        }
    }

    /// One framed RPC round-trip, followed by the configurable settle
    /// delay for devices with eventually-consistent candidate state.
    pub(super) async fn rpc(&mut self, body: &str) -> Result<String, ConfigError> {
        let frame = format!("<rpc>{body}</rpc>\n{MESSAGE_DELIMITER}\n");
        self.sender.send(frame).await?;

        let reply = self.read_reply().await?;
        if let Some(oplog) = self.oplog.as_ref() {
            let _ = oplog.record_exchange(body, &reply);
        }

        tokio::time::sleep(self.tunables.settle_delay).await;
        Ok(reply)
    }

    /// Accumulates raw chunks until the message delimiter arrives.
    async fn read_reply(&mut self) -> Result<String, ConfigError> {
        let mut buffer = String::new();
        loop {
            match self.recv.recv().await {
                Some(chunk) => {
                    trace!("{:?}", chunk);
                    buffer.push_str(&chunk);
                    if let Some(pos) = buffer.find(MESSAGE_DELIMITER) {
                        return Ok(buffer[..pos].to_string());
                    }
                }
                None => return Err(ConfigError::ChannelDisconnect),
            }
        }
    }
}

impl Transport for Session {
    async fn run_command(&mut self, command: &str) -> Result<String, ConfigError> {
        let reply = self.rpc(&text_command_rpc(command)).await?;
        let result = interpret_command_reply(command, &reply);
        if let (Err(err), Some(oplog)) = (&result, self.oplog.as_ref()) {
            let _ = oplog.record_error(&err.to_string());
        }
        result
    }

    async fn run_structured_command(&mut self, command: &str) -> Result<String, ConfigError> {
        let reply = self.rpc(&structured_command_rpc(command)).await?;
        if let Some(issue) = rpc_issues(&reply)
            .into_iter()
            .find(|issue| issue.severity == IssueSeverity::Error)
        {
            if let Some(oplog) = self.oplog.as_ref() {
                let _ = oplog.record_error(&issue.message);
            }
            return Err(ConfigError::Command {
                command: command.to_string(),
                reason: issue.message,
            });
        }
        Ok(reply)
    }

    async fn run_rpc(&mut self, body: &str) -> Result<String, ConfigError> {
        self.rpc(body).await
    }
}

/// Extracts the device identity block from a system information reply.
///
/// Returns `None` when the mandatory hardware model is missing or empty.
pub(super) fn parse_identity(raw: &str) -> Option<DeviceIdentity> {
    let model = xml_tag(raw, "hardware-model")?;
    Some(DeviceIdentity {
        model,
        hostname: xml_tag(raw, "host-name"),
        os_name: xml_tag(raw, "os-name"),
        os_version: xml_tag(raw, "os-version"),
        serial: xml_tag(raw, "serial-number"),
    })
}

fn xml_tag(raw: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = raw.find(&open)? + open.len();
    let end = raw[start..].find(&close)? + start;
    let value = raw[start..end].trim();
    if value.is_empty() {
        return None;
    }
    Some(value.to_string())
}
