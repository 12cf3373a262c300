/*!
Port série du récepteur GPS

Ouverture en 4800 bauds 8N1 sans contrôle de flux, lecture non bloquante des
octets disponibles. La configuration termios en place avant l'ouverture est
sauvegardée puis restaurée à la fermeture, pour rendre le port dans l'état où
il a été trouvé.
*/

use std::io::{Read, Write};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum SerialError {
    #[error("Could not open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("Serial port error: {0}")]
    Port(#[from] serialport::Error),

    #[error("Serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port is closed")]
    Closed,
}

/// Liaison série vers le récepteur
pub trait SerialLink: Send {
    /// Lit les octets déjà reçus, sans attendre ; 0 si rien n'est disponible
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, SerialError>;

    fn write_all(&mut self, data: &[u8]) -> Result<(), SerialError>;

    /// Ferme le port et restaure sa configuration d'origine
    fn close(&mut self);
}

/// Configuration termios sauvegardée avant l'ouverture
#[cfg(target_os = "linux")]
struct SavedTermios {
    path: std::ffi::CString,
    termios: libc::termios,
}

#[cfg(target_os = "linux")]
impl SavedTermios {
    fn open_fd(path: &std::ffi::CStr) -> std::io::Result<libc::c_int> {
        // SAFETY: `path` est une chaîne C valide terminée par un zéro
        let fd = unsafe {
            libc::open(
                path.as_ptr(),
                libc::O_RDWR | libc::O_NOCTTY | libc::O_NONBLOCK,
            )
        };
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(fd)
    }

    fn save(port: &str) -> std::io::Result<Self> {
        let path = std::ffi::CString::new(port)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let fd = Self::open_fd(&path)?;

        // SAFETY: termios est une structure C sans invariant, zéro est valide
        let mut termios: libc::termios = unsafe { std::mem::zeroed() };
        // SAFETY: `fd` est ouvert et `termios` est exclusif
        let ret = unsafe { libc::tcgetattr(fd, &mut termios) };
        let err = std::io::Error::last_os_error();
        // SAFETY: `fd` a été ouvert ci-dessus
        unsafe { libc::close(fd) };

        if ret < 0 {
            return Err(err);
        }
        Ok(SavedTermios { path, termios })
    }

    fn restore(&self) -> std::io::Result<()> {
        let fd = Self::open_fd(&self.path)?;
        // SAFETY: `fd` est ouvert et `self.termios` vient de tcgetattr
        let ret = unsafe { libc::tcsetattr(fd, libc::TCSANOW, &self.termios) };
        let err = std::io::Error::last_os_error();
        // SAFETY: `fd` a été ouvert ci-dessus
        unsafe { libc::close(fd) };

        if ret < 0 {
            return Err(err);
        }
        Ok(())
    }
}

/// Port série réel, via la crate serialport
pub struct GpsSerialPort {
    name: String,
    port: Option<Box<dyn serialport::SerialPort>>,
    #[cfg(target_os = "linux")]
    saved: Option<SavedTermios>,
}

impl GpsSerialPort {
    pub fn open(name: &str, baud_rate: u32) -> Result<Self, SerialError> {
        #[cfg(target_os = "linux")]
        let saved = match SavedTermios::save(name) {
            Ok(saved) => Some(saved),
            Err(e) => {
                warn!("Could not save serial settings of {}: {}", name, e);
                None
            }
        };

        let port = serialport::new(name, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(1))
            .open()
            .map_err(|source| SerialError::Open {
                port: name.to_string(),
                source,
            })?;

        port.clear(serialport::ClearBuffer::All)?;
        debug!("Serial port {} opened at {} baud", name, baud_rate);

        Ok(GpsSerialPort {
            name: name.to_string(),
            port: Some(port),
            #[cfg(target_os = "linux")]
            saved,
        })
    }
}

impl SerialLink for GpsSerialPort {
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, SerialError> {
        let port = self.port.as_mut().ok_or(SerialError::Closed)?;

        let pending = port.bytes_to_read()? as usize;
        if pending == 0 {
            return Ok(0);
        }

        let wanted = pending.min(buf.len());
        match port.read(&mut buf[..wanted]) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), SerialError> {
        let port = self.port.as_mut().ok_or(SerialError::Closed)?;
        port.write_all(data)?;
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_none() {
            return;
        }

        #[cfg(target_os = "linux")]
        {
            if let Some(saved) = self.saved.take() {
                if let Err(e) = saved.restore() {
                    warn!("Could not restore serial settings of {}: {}", self.name, e);
                }
            }
        }

        debug!("Serial port {} closed", self.name);
    }
}

impl Drop for GpsSerialPort {
    fn drop(&mut self) {
        self.close();
    }
}

/// Port série simulé : octets à recevoir fournis par le test, écritures mémorisées
#[cfg(test)]
#[derive(Clone, Default)]
pub struct ScriptedSerial {
    pub state: std::sync::Arc<std::sync::Mutex<ScriptedSerialState>>,
}

#[cfg(test)]
#[derive(Default)]
pub struct ScriptedSerialState {
    pub incoming: std::collections::VecDeque<u8>,
    pub written: Vec<u8>,
    pub closed: bool,
    pub fail_reads: bool,
}

#[cfg(test)]
impl ScriptedSerial {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_input(&self, data: &[u8]) {
        self.state.lock().unwrap().incoming.extend(data.iter().copied());
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.lock().unwrap().written.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

#[cfg(test)]
impl SerialLink for ScriptedSerial {
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, SerialError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_reads {
            return Err(SerialError::Io(std::io::Error::from_raw_os_error(libc::EIO)));
        }
        let n = state.incoming.len().min(buf.len());
        for (slot, byte) in buf.iter_mut().zip(state.incoming.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), SerialError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(SerialError::Closed);
        }
        state.written.extend_from_slice(data);
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().unwrap().closed = true;
    }
}
