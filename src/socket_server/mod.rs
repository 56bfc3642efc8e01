pub mod config;

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::{
    net::{UnixListener, UnixStream},
    sync::broadcast,
    task::JoinHandle,
};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    fields::{FieldId, FieldStore},
    protocol::{
        client_command::ClientCommand, parse_command, serialize_response,
        server_response::ServerResponse,
    },
    supervisor::BoardSupervisor,
};
use config::SocketServerConfig;

/// Remote field access: newline-delimited JSON over a Unix socket.
pub struct SocketServer {
    config: SocketServerConfig,
    supervisor: Arc<BoardSupervisor>,
    store: Arc<FieldStore>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    accept_task: Option<JoinHandle<()>>,
}

impl SocketServer {
    pub fn new(config: SocketServerConfig, supervisor: Arc<BoardSupervisor>, store: Arc<FieldStore>) -> Self {
        Self {
            config,
            supervisor,
            store,
            shutdown_tx: None,
            accept_task: None,
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        if Path::new(&self.config.socket_path).exists() {
            tokio::fs::remove_file(&self.config.socket_path).await?;
        }

        let listener = UnixListener::bind(&self.config.socket_path)?;
        info!("Socket server listening on: {}", self.config.socket_path);

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx);

        let supervisor = self.supervisor.clone();
        let store = self.store.clone();
        let max_connections = self.config.max_connections;

        self.accept_task = Some(tokio::spawn(async move {
            let active_connections = Arc::new(AtomicUsize::new(0));

            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _addr)) => {
                                let current = active_connections.load(Ordering::Relaxed);
                                if current >= max_connections {
                                    warn!("Maximum connections reached ({}), rejecting new connection", current);
                                    continue;
                                }

                                let connection_id = Uuid::new_v4();
                                let count = active_connections.fetch_add(1, Ordering::Relaxed) + 1;
                                debug!("Client {} connected. Active connections: {}", connection_id, count);

                                let supervisor = supervisor.clone();
                                let store = store.clone();
                                let mut client_shutdown = shutdown_rx.resubscribe();
                                let active = active_connections.clone();

                                tokio::spawn(async move {
                                    let result = Self::handle_client(
                                        connection_id,
                                        stream,
                                        &supervisor,
                                        &store,
                                        &mut client_shutdown,
                                    )
                                    .await;
                                    if let Err(e) = result {
                                        error!("Client {} handler error: {}", connection_id, e);
                                    }

                                    let remaining = active.fetch_sub(1, Ordering::Relaxed) - 1;
                                    debug!("Client {} disconnected. Active connections: {}", connection_id, remaining);
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept connection: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Socket server shutting down");
                        break;
                    }
                }
            }
        }));

        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.accept_task.take() {
            task.await?;
        }

        if Path::new(&self.config.socket_path).exists() {
            tokio::fs::remove_file(&self.config.socket_path).await?;
        }

        info!("Socket server shutdown complete");
        Ok(())
    }

    async fn handle_client(
        connection_id: Uuid,
        stream: UnixStream,
        supervisor: &BoardSupervisor,
        store: &FieldStore,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<()> {
        let mut framed = Framed::new(stream, LinesCodec::new());

        loop {
            tokio::select! {
                line_result = framed.next() => {
                    match line_result {
                        Some(Ok(line)) => {
                            debug!("[{}] received: {}", connection_id, line);

                            let response = Self::process_command(&line, supervisor, store).await;
                            let response_json = serialize_response(&response)?;

                            if let Err(e) = framed.send(response_json).await {
                                error!("[{}] failed to send response: {}", connection_id, e);
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            error!("[{}] error reading from client: {}", connection_id, e);
                            break;
                        }
                        None => break,
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("[{}] shutdown signal received, closing connection", connection_id);
                    break;
                }
            }
        }

        Ok(())
    }

    async fn process_command(line: &str, supervisor: &BoardSupervisor, store: &FieldStore) -> ServerResponse {
        let command = match parse_command(line) {
            Ok(cmd) => cmd,
            Err(e) => {
                return ServerResponse::error(None, format!("Failed to parse command: {}", e));
            }
        };

        let command_id = command.id().cloned();

        match Self::execute_command(command, supervisor, store).await {
            Ok(data) => ServerResponse::success(command_id, data),
            Err(e) => ServerResponse::from_error(command_id, &e),
        }
    }

    async fn execute_command(
        command: ClientCommand,
        supervisor: &BoardSupervisor,
        store: &FieldStore,
    ) -> Result<serde_json::Value> {
        match command {
            ClientCommand::Put {
                axis, field, value, ..
            } => {
                supervisor.axis(&axis)?.write(field, value.clone()).await?;
                Ok(json!({"axis": axis, "field": field, "value": value}))
            }
            ClientCommand::Get { axis, field, .. } => {
                let value = store.get(&axis, field).await?;
                Ok(json!({"axis": axis, "field": field, "value": value}))
            }
            ClientCommand::GetAxis { axis, .. } => {
                let fields = store.get_all(&axis).await?;
                let alarm = store.alarm(&axis).await;
                Ok(json!({"axis": axis, "fields": fields, "alarm": alarm}))
            }
            ClientCommand::ListAxes { .. } => Ok(json!({
                "board": supervisor.name(),
                "axes": supervisor.axis_ids(),
            })),
            ClientCommand::ListFields { .. } => Ok(json!({"fields": FieldId::descriptors()})),
            ClientCommand::GetParameter {
                axis, parameter, ..
            } => {
                let number = supervisor.axis(&axis)?.axis_number();
                let value = supervisor.device().read_parameter(number, parameter).await?;
                Ok(json!({"axis": axis, "parameter": parameter, "value": value}))
            }
            ClientCommand::SetParameter {
                axis,
                parameter,
                value,
                ..
            } => {
                let number = supervisor.axis(&axis)?.axis_number();
                supervisor
                    .device()
                    .write_parameter(number, parameter, value)
                    .await?;
                Ok(json!({"axis": axis, "parameter": parameter, "value": value}))
            }
            ClientCommand::Ping { .. } => Ok(json!({
                "message": "pong",
                "timestamp": chrono::Utc::now().to_rfc3339()
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        axis::config::tests::linear_config,
        fields::FieldValue,
        motor_controller::simulated::{SimulatedBoard, SimulatedController},
        supervisor::config::SupervisorConfig,
    };
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    async fn request(stream: &mut BufReader<UnixStream>, line: &str) -> serde_json::Value {
        stream.get_mut().write_all(line.as_bytes()).await.unwrap();
        stream.get_mut().write_all(b"\n").await.unwrap();
        let mut reply = String::new();
        stream.read_line(&mut reply).await.unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    #[tokio::test]
    async fn test_put_and_get_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("bridge.sock");

        let driver = Arc::new(SimulatedController::new(SimulatedBoard::default()));
        let store = Arc::new(FieldStore::new());
        let mut supervisor =
            BoardSupervisor::new(SupervisorConfig::default(), driver, store.clone());
        supervisor.register_axis(linear_config()).await.unwrap();
        let supervisor = Arc::new(supervisor);

        let config = SocketServerConfig {
            socket_path: socket_path.to_string_lossy().into_owned(),
            max_connections: 4,
        };
        let mut server = SocketServer::new(config, supervisor.clone(), store.clone());
        server.start().await.unwrap();

        // first poll publishes the read-backs
        tokio::time::timeout(Duration::from_secs(2), async {
            while store.get("X", FieldId::Rbv).await.ok() != Some(FieldValue::Float(-50.0)) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let mut stream = BufReader::new(stream);

        let pong = request(&mut stream, r#"{"type":"ping","id":"1"}"#).await;
        assert_eq!(pong["status"], "success");
        assert_eq!(pong["id"], "1");

        let rbv = request(&mut stream, r#"{"type":"get","axis":"X","field":"RBV"}"#).await;
        assert_eq!(rbv["data"]["value"], -50.0);

        let rejected = request(
            &mut stream,
            r#"{"type":"put","axis":"X","field":"VAL","value":1000}"#,
        )
        .await;
        assert_eq!(rejected["status"], "error");
        assert_eq!(rejected["code"], "out_of_range");

        let unknown = request(&mut stream, r#"{"type":"get_axis","axis":"Q"}"#).await;
        assert_eq!(unknown["code"], "unknown_axis");

        let set = request(
            &mut stream,
            r#"{"type":"set_parameter","axis":"X","parameter":6,"value":90}"#,
        )
        .await;
        assert_eq!(set["status"], "success");
        let get = request(&mut stream, r#"{"type":"get_parameter","axis":"X","parameter":6}"#).await;
        assert_eq!(get["data"]["value"], 90);

        let garbage = request(&mut stream, "not json").await;
        assert_eq!(garbage["status"], "error");

        drop(stream);
        server.shutdown().await.unwrap();
        assert!(!socket_path.exists());
        supervisor.shutdown().await.unwrap();
    }
}
