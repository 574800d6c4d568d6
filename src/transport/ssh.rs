use super::*;

/// Control characters some devices emit at the start of a line.
static IGNORE_START_LINE: Lazy<Regex> =
    Lazy::new(
        || match Regex::new(r"^(\r+(\s+\r+)*)|(\u{8}+(\s+\u{8}+)*)") {
            Ok(re) => re,
            Err(err) => panic!("invalid IGNORE_START_LINE regex: {err}"),
        },
    );

/// SSH shell driver built on `async-ssh2-tokio`.
#[derive(Debug, Clone, Default)]
pub struct SshDriver {
    security: ConnectionSecurityOptions,
}

impl SshDriver {
    pub fn new(security: ConnectionSecurityOptions) -> Self {
        Self { security }
    }
}

/// An interactive shell on one device.
pub struct SshHandle {
    client: Client,
    sender: Sender<String>,
    recv: Receiver<String>,
    profile: &'static PlatformProfile,
    prompt: String,
    label: String,
}

struct Reply {
    output: String,
    rejected: bool,
}

/// Decodes everything in `pending` except a multibyte character cut off by
/// the end of the chunk, which stays buffered. Invalid bytes decode lossily.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    let mut keep = pending.len();
    for back in 1..=pending.len().min(3) {
        let byte = pending[pending.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        if width > back {
            keep = pending.len() - back;
        }
        break;
    }
    let tail = pending.split_off(keep);
    let text = String::from_utf8_lossy(pending).into_owned();
    *pending = tail;
    text
}

fn map_connect_error(err: async_ssh2_tokio::Error) -> TransportError {
    let text = err.to_string();
    match err {
        async_ssh2_tokio::Error::PasswordWrong | async_ssh2_tokio::Error::KeyAuthFailed => {
            TransportError::AuthFailed(text)
        }
        async_ssh2_tokio::Error::AddressInvalid(_) => TransportError::Unreachable(text),
        _ => {
            let lower = text.to_ascii_lowercase();
            if lower.contains("refused") {
                TransportError::Refused(text)
            } else if lower.contains("timed out") || lower.contains("timeout") {
                TransportError::Timeout(text)
            } else if lower.contains("unreachable") || lower.contains("no route") {
                TransportError::Unreachable(text)
            } else {
                TransportError::Other(text)
            }
        }
    }
}

#[async_trait]
impl TransportDriver for SshDriver {
    async fn connect(
        &self,
        device: &DeviceIdentity,
        credential: &ResolvedCredential,
        timeout: Duration,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        let label = format!("{}@{}", credential.username(), device.address());
        let profile = templates::profile_for(&device.platform);

        let config = Config {
            preferred: self.security.preferred(),
            inactivity_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        };

        let client = tokio::time::timeout(
            timeout,
            Client::connect_with_config(
                (device.host.clone(), device.port),
                credential.username(),
                AuthMethod::with_password(credential.password().expose()),
                self.security.server_check.clone(),
                config,
            ),
        )
        .await
        .map_err(|_| TransportError::Timeout(format!("connecting to {label}")))?
        .map_err(map_connect_error)?;
        debug!("{} TCP connection successful", label);

        let mut channel = client
            .get_channel()
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?;
        channel
            .request_pty(false, "xterm", 800, 600, 0, 0, &[])
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?;
        debug!("{} Shell request successful", label);

        let (sender_to_shell, mut receiver_from_user) = mpsc::channel::<String>(256);
        let (sender_to_user, receiver_from_shell) = mpsc::channel::<String>(256);

        let io_label = label.clone();
        tokio::spawn(async move {
            let mut pending: Vec<u8> = Vec::new();
            loop {
                tokio::select! {
                    Some(data) = receiver_from_user.recv() => {
                        if let Err(e) = channel.data(data.as_bytes()).await {
                            debug!("{} Failed to send data to shell: {:?}", io_label, e);
                            break;
                        }
                    },
                    Some(msg) = channel.wait() => {
                        match msg {
                            ChannelMsg::Data { ref data } => {
                                pending.extend_from_slice(data);
                                let text = take_utf8(&mut pending);
                                if !text.is_empty() && sender_to_user.send(text).await.is_err() {
                                    debug!("{} Shell output receiver dropped. Closing task.", io_label);
                                    break;
                                }
                            }
                            ChannelMsg::ExitStatus { exit_status } => {
                                debug!("{} Shell exited with status code: {}", io_label, exit_status);
                                let _ = channel.eof().await;
                                break;
                            }
                            ChannelMsg::Eof => {
                                debug!("{} Shell sent EOF.", io_label);
                                break;
                            }
                            _ => {}
                        }
                    }
                    else => break,
                }
            }
            debug!("{} SSH I/O task ended.", io_label);
        });

        let mut handle = SshHandle {
            client,
            sender: sender_to_shell,
            recv: receiver_from_shell,
            profile,
            prompt: String::new(),
            label,
        };

        handle.read_until_prompt(timeout, None).await?;

        if handle.profile.is_user_prompt(&handle.prompt)
            && let Some(enable) = handle.profile.enable_command
        {
            match credential.enable_password() {
                Some(secret) => handle.elevate(enable, secret.expose(), timeout).await?,
                None => debug!("{} stays in user mode: no enable password", handle.label),
            }
        }

        if let Some(pager) = handle.profile.pager_disable {
            handle.send(pager, timeout).await?;
        }

        Ok(Box::new(handle))
    }
}

impl SshHandle {
    async fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        self.sender
            .send(format!("{line}\n"))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn elevate(
        &mut self,
        enable: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        self.write_line(enable).await?;
        self.read_until_prompt(timeout, Some(password)).await?;
        if self.profile.is_user_prompt(&self.prompt) {
            return Err(TransportError::AuthFailed(format!(
                "{} rejected the enable password",
                self.label
            )));
        }
        debug!("{} entered privileged mode", self.label);
        Ok(())
    }

    /// Reads until a prompt appears on an unterminated line.
    ///
    /// Pager prompts are continued automatically; `secret_reply` answers at
    /// most one password prompt.
    async fn read_until_prompt(
        &mut self,
        timeout: Duration,
        mut secret_reply: Option<&str>,
    ) -> Result<Reply, TransportError> {
        let profile = self.profile;
        let label = self.label.clone();
        let sender = self.sender.clone();
        let recv = &mut self.recv;
        let prompt = &mut self.prompt;

        let mut output = String::new();
        let mut line_buffer = String::new();
        let mut rejected = false;

        let result = tokio::time::timeout(timeout, async {
            loop {
                let Some(data) = recv.recv().await else {
                    return Err(TransportError::Closed);
                };
                trace!("{:?}", data);
                line_buffer.push_str(&data);

                while let Some(newline_pos) = line_buffer.find('\n') {
                    let line: String = line_buffer.drain(..=newline_pos).collect();
                    let cleaned = IGNORE_START_LINE.replace(&line, "");
                    let trimmed = cleaned.trim_end();
                    if profile.is_pager(trimmed) {
                        continue;
                    }
                    if profile.is_error(trimmed) {
                        rejected = true;
                    }
                    output.push_str(&cleaned);
                }

                if line_buffer.is_empty() {
                    continue;
                }
                if profile.is_pager(&line_buffer) {
                    trace!("{} pager prompt, continuing", label);
                    line_buffer.clear();
                    sender.send(" ".to_string()).await.map_err(|_| TransportError::Closed)?;
                    continue;
                }
                if let Some(secret) = secret_reply
                    && profile.is_enable_password_prompt(&line_buffer)
                {
                    line_buffer.clear();
                    secret_reply = None;
                    sender
                        .send(format!("{secret}\n"))
                        .await
                        .map_err(|_| TransportError::Closed)?;
                    continue;
                }
                let candidate = line_buffer.trim_end();
                if profile.is_prompt(candidate) {
                    *prompt = candidate.to_string();
                    output.push_str(&line_buffer);
                    return Ok(());
                }
            }
        })
        .await;

        match result {
            Err(_) => Err(TransportError::Timeout(output)),
            Ok(Err(err)) => Err(err),
            Ok(Ok(())) => Ok(Reply { output, rejected }),
        }
    }
}

#[async_trait]
impl TransportHandle for SshHandle {
    async fn send(&mut self, command: &str, timeout: Duration) -> Result<String, TransportError> {
        while self.recv.try_recv().is_ok() {}
        self.write_line(command).await?;

        let reply = self.read_until_prompt(timeout, None).await?;
        let mut content = reply.output.as_str();

        if !command.is_empty() && content.starts_with(command) {
            content = content
                .strip_prefix(command)
                .unwrap_or(content)
                .trim_start_matches(['\n', '\r']);
        }

        let content = match content.rfind('\n') {
            Some(pos) => &content[..pos],
            None => "",
        };

        if reply.rejected {
            return Err(TransportError::Rejected(content.to_string()));
        }
        Ok(content.to_string())
    }

    async fn close(&mut self) {
        debug!("{} closing SSH session", self.label);
        self.recv.close();
        if self.is_alive() {
            if let Err(e) = self.sender.send("exit\n".to_string()).await {
                debug!("{} failed to send exit: {:?}", self.label, e);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    fn is_alive(&self) -> bool {
        !self.client.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_map_to_auth_failed() {
        assert!(matches!(
            map_connect_error(async_ssh2_tokio::Error::PasswordWrong),
            TransportError::AuthFailed(_)
        ));
        assert!(matches!(
            map_connect_error(async_ssh2_tokio::Error::KeyAuthFailed),
            TransportError::AuthFailed(_)
        ));
    }

    #[test]
    fn characters_split_across_chunks_are_kept() {
        let mut pending = b"desc caf\xC3".to_vec();
        assert_eq!(take_utf8(&mut pending), "desc caf");
        assert_eq!(pending, vec![0xC3]);
        pending.extend_from_slice(b"\xA9 \xE2\x94");
        assert_eq!(take_utf8(&mut pending), "\u{e9} ");
        pending.extend_from_slice(b"\x80\n");
        assert_eq!(take_utf8(&mut pending), "\u{2500}\n");
        assert!(pending.is_empty());

        let mut broken = b"a\xFFb".to_vec();
        assert_eq!(take_utf8(&mut broken), "a\u{fffd}b");
        assert!(broken.is_empty());
    }

    #[test]
    fn control_characters_are_stripped_from_line_start() {
        let cleaned = IGNORE_START_LINE.replace("\r\r  \rinterface Gi0/1", "");
        assert_eq!(cleaned, "interface Gi0/1");
    }
}
