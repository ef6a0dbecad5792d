use std::{
    collections::HashMap,
    io::{self, Write},
};

use log::{debug, warn};
use metricast_proto::{Encoding, Sample};

/// Writes one line per received sample, optionally for a subset of hosts.
#[derive(Debug)]
pub struct SamplePrinter<W> {
    out: W,
    hosts: Vec<String>,
    last_uptime: HashMap<String, i64>,
}

impl<W: Write> SamplePrinter<W> {
    pub fn new(out: W, hosts: Vec<String>) -> Self {
        Self {
            out,
            hosts,
            last_uptime: HashMap::new(),
        }
    }

    fn wants(&self, hostname: &str) -> bool {
        self.hosts.is_empty() || self.hosts.iter().any(|h| h == hostname)
    }

    /// Decode and print one frame. Undecodable frames are logged and skipped.
    pub fn handle(&mut self, encoding: Encoding, bytes: &[u8]) -> io::Result<()> {
        let sample = match encoding.decode(bytes) {
            Ok(sample) => sample,
            Err(e) => {
                warn!("failed to decode {encoding} frame: {e}");
                return Ok(());
            }
        };

        if !self.wants(&sample.hostname) {
            return Ok(());
        }

        // uptime keeps counting while a server is offline or samples are dropped
        if let Some(previous) = self
            .last_uptime
            .insert(sample.hostname.clone(), sample.uptime)
        {
            let silent = sample.uptime - previous - 1;
            if silent > 0 {
                debug!("{} was silent for {silent} ticks", sample.hostname);
            }
        }

        writeln!(self.out, "{}", format_sample(&sample))
    }

    #[cfg(test)]
    pub(crate) fn into_inner(self) -> W {
        self.out
    }
}

pub fn format_sample(sample: &Sample) -> String {
    format!(
        "{} {:<12} cpu {:>5.1}%  mem {:>5.1}%  disk {:>6.1} MB/s  net {:>5.1}/{:>5.1} MB/s  up {}s",
        sample.timestamp,
        sample.hostname,
        sample.cpu_usage,
        sample.memory_usage,
        sample.disk_io,
        sample.network_in,
        sample.network_out,
        sample.uptime,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(hostname: &str, uptime: i64) -> Sample {
        Sample {
            timestamp: 1_700_000_000,
            cpu_usage: 85.3,
            memory_usage: 80.0,
            disk_io: 640.5,
            network_in: 200.0,
            network_out: 310.7,
            uptime,
            hostname: hostname.to_owned(),
        }
    }

    fn frame(encoding: Encoding, sample: &Sample) -> Vec<u8> {
        encoding.encode(sample).unwrap().as_bytes().to_vec()
    }

    #[test]
    fn formats_one_line() {
        assert_eq!(
            format_sample(&sample("server-1", 42)),
            "1700000000 server-1     cpu  85.3%  mem  80.0%  disk  640.5 MB/s  net 200.0/310.7 MB/s  up 42s"
        );
    }

    #[test]
    fn prints_both_encodings() {
        let mut printer = SamplePrinter::new(Vec::new(), Vec::new());
        printer
            .handle(Encoding::Json, &frame(Encoding::Json, &sample("server-1", 1)))
            .unwrap();
        printer
            .handle(
                Encoding::Postcard,
                &frame(Encoding::Postcard, &sample("server-2", 2)),
            )
            .unwrap();

        let out = String::from_utf8(printer.into_inner()).unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("server-1"));
        assert!(lines[1].contains("server-2"));
    }

    #[test]
    fn filters_hosts() {
        let mut printer = SamplePrinter::new(Vec::new(), vec!["server-4".to_owned()]);
        for host in ["server-1", "server-4", "server-5"] {
            printer
                .handle(Encoding::Json, &frame(Encoding::Json, &sample(host, 0)))
                .unwrap();
        }

        let out = String::from_utf8(printer.into_inner()).unwrap();
        assert_eq!(out.lines().count(), 1);
        assert!(out.contains("server-4"));
    }

    #[test]
    fn skips_garbage() {
        let mut printer = SamplePrinter::new(Vec::new(), Vec::new());
        printer.handle(Encoding::Json, b"{\"cpu_usage\":").unwrap();
        assert!(printer.into_inner().is_empty());
    }
}
