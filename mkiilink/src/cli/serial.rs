use dialoguer::{theme::ColorfulTheme, Confirm, Select};
use log::error;
use serialport::{available_ports, SerialPortInfo, SerialPortType, UsbPortInfo};

use super::{config::Config, config::UsbDevice, ConnectArgs};
use crate::error::Error;

/// Pick the serial port to open
///
/// A port given on the command line wins over one from the configuration
/// file. Without either, the user is asked to choose among the detected
/// ports; a lone detected port is used directly.
pub fn get_serial_port_info(args: &ConnectArgs, config: &Config) -> Result<SerialPortInfo, Error> {
    let ports = detect_usb_serial_ports()?;

    if let Some(serial) = &args.port {
        find_serial_port(&ports, serial)
    } else if let Some(serial) = &config.connection.serial {
        find_serial_port(&ports, serial)
    } else {
        let (port, matches) = select_serial_port(ports, config)?;

        if let SerialPortType::UsbPort(usb_info) = &port.port_type {
            if !matches {
                let remember = Confirm::with_theme(&ColorfulTheme::default())
                    .with_prompt("Remember this serial port for future use?")
                    .interact_opt()?
                    .unwrap_or_default();

                if remember {
                    // not fatal, carry on with the selected port
                    if let Err(e) = config.save_with(|config| {
                        config.usb_device.push(UsbDevice {
                            vid: usb_info.vid,
                            pid: usb_info.pid,
                        })
                    }) {
                        error!("Failed to save config {e:#}");
                    }
                }
            }
        }

        Ok(port)
    }
}

/// Given a vector of `SerialPortInfo` structs, attempt to find and return one
/// whose `port_name` field matches the provided `name` argument.
fn find_serial_port(ports: &[SerialPortInfo], name: &str) -> Result<SerialPortInfo, Error> {
    let port_info = ports
        .iter()
        .find(|port| port.port_name.eq_ignore_ascii_case(name));

    match port_info {
        Some(port) => Ok(port.to_owned()),
        // ports which aren't enumerated (pty pairs, some adapters) are still usable by name
        None if std::path::Path::new(name).exists() => Ok(SerialPortInfo {
            port_name: name.to_owned(),
            port_type: SerialPortType::Unknown,
        }),
        None => Err(Error::SerialNotFound(name.to_owned())),
    }
}

fn detect_usb_serial_ports() -> Result<Vec<SerialPortInfo>, Error> {
    let ports = available_ports()?
        .into_iter()
        .filter(|port_info| {
            matches!(
                &port_info.port_type,
                SerialPortType::UsbPort(..) | SerialPortType::Unknown
            )
        })
        .collect::<Vec<_>>();

    Ok(ports)
}

/// USB serial devices found on MKII boards and their programming cables
const KNOWN_DEVICES: &[UsbDevice] = &[
    UsbDevice {
        vid: 0x0483,
        pid: 0x5740,
    }, // STMicroelectronics virtual COM port
    UsbDevice {
        vid: 0x0403,
        pid: 0x6001,
    }, // FTDI FT232R UART
    UsbDevice {
        vid: 0x10c4,
        pid: 0xea60,
    }, // Silicon Labs CP210x UART Bridge
];

fn select_serial_port(
    ports: Vec<SerialPortInfo>,
    config: &Config,
) -> Result<(SerialPortInfo, bool), Error> {
    let device_matches = |info: &UsbPortInfo| {
        config
            .usb_device
            .iter()
            .chain(KNOWN_DEVICES.iter())
            .any(|dev| dev.matches(info))
    };

    if ports.len() > 1 {
        println!(
            "Detected {} serial ports. Ports which match a known device are marked with *.\n",
            ports.len()
        );

        let port_names = ports
            .iter()
            .map(|port_info| match &port_info.port_type {
                SerialPortType::UsbPort(info) => {
                    let marker = if device_matches(info) { "* " } else { "  " };
                    match &info.product {
                        Some(product) => format!("{marker}{} - {product}", port_info.port_name),
                        None => format!("{marker}{}", port_info.port_name),
                    }
                }
                _ => format!("  {}", port_info.port_name),
            })
            .collect::<Vec<_>>();

        let index = Select::with_theme(&ColorfulTheme::default())
            .items(&port_names)
            .default(0)
            .interact_opt()?
            .ok_or(Error::Cancelled)?;

        let port_info = ports.get(index).ok_or(Error::Cancelled)?;
        let matches = match &port_info.port_type {
            SerialPortType::UsbPort(usb_info) => device_matches(usb_info),
            _ => false,
        };

        Ok((port_info.to_owned(), matches))
    } else if let [port] = ports.as_slice() {
        let matches = match &port.port_type {
            SerialPortType::UsbPort(info) => device_matches(info),
            _ => false,
        };

        println!("Using the only serial port detected: {}", port.port_name);
        Ok((port.to_owned(), matches))
    } else {
        Err(Error::NoSerial)
    }
}
