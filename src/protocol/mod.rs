pub mod client_command;
pub mod error;
pub mod server_response;

use client_command::ClientCommand;
use error::ProtocolError;
use server_response::ServerResponse;

pub fn parse_command(json_str: &str) -> Result<ClientCommand, ProtocolError> {
    Ok(serde_json::from_str(json_str)?)
}

pub fn serialize_response(response: &ServerResponse) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(response)?)
}
