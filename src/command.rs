//! Supported network commands
//!
//! The command name of an inbound request is resolved to a variant when the request
//! is decoded, so dispatch inside the orchestrator is an exhaustive `match`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! network_commands {
    ($($variant:ident => $name:literal,)+) => {
        /// One variant per command the orchestrator accepts
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "&'static str")]
        pub enum NetworkCommand {
            $($variant,)+
        }

        impl NetworkCommand {
            pub const ALL: &'static [NetworkCommand] = &[$(NetworkCommand::$variant,)+];

            /// Wire name of the command
            pub fn as_str(self) -> &'static str {
                match self {
                    $(NetworkCommand::$variant => $name,)+
                }
            }
        }

        impl FromStr for NetworkCommand {
            type Err = UnknownCommand;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(NetworkCommand::$variant),)+
                    other => Err(UnknownCommand(other.to_string())),
                }
            }
        }
    };
}

network_commands! {
    RemoveNetworkRoute => "removeNetworkRoute",
    SetDns => "setDNS",
    GetNetId => "getNetId",
    CreateNetwork => "createNetwork",
    DestroyNetwork => "destroyNetwork",
    SetDefaultRoute => "setDefaultRoute",
    RemoveDefaultRoute => "removeDefaultRoute",
    AddHostRoute => "addHostRoute",
    RemoveHostRoute => "removeHostRoute",
    AddSecondaryRoute => "addSecondaryRoute",
    RemoveSecondaryRoute => "removeSecondaryRoute",
    SetMtu => "setMtu",
    SetDefaultNetwork => "setDefaultNetwork",
    AddInterfaceToNetwork => "addInterfaceToNetwork",
    RemoveInterfaceToNetwork => "removeInterfaceToNetwork",
    SetIpv6Status => "setIpv6Status",
    DhcpRequest => "dhcpRequest",
    StopDhcp => "stopDhcp",
    GetInterfaces => "getInterfaces",
    GetInterfaceConfig => "getInterfaceConfig",
    SetInterfaceConfig => "setInterfaceConfig",
    StartClatd => "startClatd",
    StopClatd => "stopClatd",
    SetTcpBufferSize => "setTcpBufferSize",
    SetNetworkInterfaceAlarm => "setNetworkInterfaceAlarm",
    EnableNetworkInterfaceAlarm => "enableNetworkInterfaceAlarm",
    DisableNetworkInterfaceAlarm => "disableNetworkInterfaceAlarm",
    SetTetheringAlarm => "setTetheringAlarm",
    RemoveTetheringAlarm => "removeTetheringAlarm",
    SetDhcpServer => "setDhcpServer",
    GetTetheringStatus => "getTetheringStatus",
    GetTetherStats => "getTetherStats",
    UpdateUpStream => "updateUpStream",
    RemoveUpStream => "removeUpStream",
    SetUsbTethering => "setUSBTethering",
    SetWifiTethering => "setWifiTethering",
    SetupPrefix64Discovery => "setupPrefix64Discovery",
}

/// Command name with no matching variant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown network command: {0}")]
pub struct UnknownCommand(pub String);

impl TryFrom<String> for NetworkCommand {
    type Error = UnknownCommand;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NetworkCommand> for &'static str {
    fn from(cmd: NetworkCommand) -> Self {
        cmd.as_str()
    }
}

impl fmt::Display for NetworkCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
