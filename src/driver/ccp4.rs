//! CCP4 conventions layered onto any driver.
//!
//! `Ccp4Capability` owns a plain [`Driver`] and adds what CCP4 programs
//! share: `hklin`/`hklout`/`xyzin`/`xyzout`/`mapin`/`mapout` keywords on the
//! command line, the CCP4 library directory on the library path, scratch
//! directories, library-signal checking and loggraph tables in the output.

use super::Driver;
use crate::error::{Error, Result, ToolError};
use indexmap::IndexMap;
use std::path::{Path, PathBuf};

/// One `$TABLE` block from program output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogGraph {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl LogGraph {
    /// Values of `column` parsed as numbers, skipping unparsable cells.
    pub fn column(&self, column: &str) -> Vec<f64> {
        let Some(index) = self.columns.iter().position(|c| c == column) else {
            return Vec::new();
        };
        self.rows
            .iter()
            .filter_map(|row| row.get(index).and_then(|v| v.parse().ok()))
            .collect()
    }
}

/// Extract every loggraph table from `output`, keyed by table title.
pub fn parse_loggraph(output: &[String]) -> Result<IndexMap<String, LogGraph>> {
    let mut tables = IndexMap::new();
    let mut i = 0;
    while i < output.len() {
        let line = &output[i];
        if !line.contains("$TABLE") {
            i += 1;
            continue;
        }
        let title = line
            .split(':')
            .nth(1)
            .unwrap_or_default()
            .replace('>', "")
            .trim()
            .to_string();

        let mut block = String::new();
        let mut markers = 0;
        while i < output.len() && markers < 4 {
            markers += output[i].matches("$$").count();
            block.push_str(&output[i]);
            block.push('\n');
            i += 1;
        }
        let sections: Vec<&str> = block.split("$$").collect();
        if sections.len() < 4 {
            return Err(ToolError::Failed {
                program: "loggraph".into(),
                message: format!("loggraph \"{title}\" broken"),
                hint: None,
            }
            .into());
        }
        let columns: Vec<String> = sections[1].split_whitespace().map(str::to_string).collect();
        let rows = sections[3]
            .lines()
            .map(|l| l.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .filter(|r| r.len() == columns.len())
            .collect();
        tables.insert(title, LogGraph { columns, rows });
    }
    Ok(tables)
}

/// A driver with CCP4 file keywords and output conventions.
pub struct Ccp4Capability {
    driver: Box<dyn Driver>,
    hklin: Vec<PathBuf>,
    hklout: Option<PathBuf>,
    xyzin: Option<PathBuf>,
    xyzout: Option<PathBuf>,
    mapin: Option<PathBuf>,
    mapout: Option<PathBuf>,
    scratch: Option<PathBuf>,
    loggraphs: IndexMap<String, LogGraph>,
}

impl Ccp4Capability {
    /// Wrap `driver`, putting the CCP4 library directory `clib` (when
    /// known) at the front of the library search path.
    pub fn new(mut driver: Box<dyn Driver>, clib: Option<&str>, scratch: Option<&Path>) -> Self {
        if let Some(clib) = clib {
            let variable = if cfg!(target_os = "macos") {
                "DYLD_LIBRARY_PATH"
            } else {
                "LD_LIBRARY_PATH"
            };
            driver.add_environment(variable, clib);
        }
        if let Some(scratch) = scratch {
            driver.set_environment("CCP4_SCR", &scratch.display().to_string());
        }
        Self {
            driver,
            hklin: Vec::new(),
            hklout: None,
            xyzin: None,
            xyzout: None,
            mapin: None,
            mapout: None,
            scratch: scratch.map(Path::to_path_buf),
            loggraphs: IndexMap::new(),
        }
    }

    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    pub fn driver_mut(&mut self) -> &mut dyn Driver {
        self.driver.as_mut()
    }

    pub fn into_driver(self) -> Box<dyn Driver> {
        self.driver
    }

    pub fn set_hklin(&mut self, hklin: impl Into<PathBuf>) {
        self.hklin = vec![hklin.into()];
    }

    /// Several input reflection files, for programs that merge them.
    pub fn set_hklin_files(&mut self, files: Vec<PathBuf>) {
        self.hklin = files;
    }

    pub fn hklin(&self) -> &[PathBuf] {
        &self.hklin
    }

    pub fn set_hklout(&mut self, hklout: impl Into<PathBuf>) {
        self.hklout = Some(hklout.into());
    }

    pub fn hklout(&self) -> Option<&Path> {
        self.hklout.as_deref()
    }

    pub fn set_xyzin(&mut self, path: impl Into<PathBuf>) {
        self.xyzin = Some(path.into());
    }

    pub fn set_xyzout(&mut self, path: impl Into<PathBuf>) {
        self.xyzout = Some(path.into());
    }

    pub fn set_mapin(&mut self, path: impl Into<PathBuf>) {
        self.mapin = Some(path.into());
    }

    pub fn set_mapout(&mut self, path: impl Into<PathBuf>) {
        self.mapout = Some(path.into());
    }

    pub fn check_hklin(&self) -> Result<()> {
        if self.hklin.is_empty() {
            return Err(Error::InvalidArgument("hklin not defined".into()));
        }
        for hklin in &self.hklin {
            if !hklin.exists() {
                return Err(Error::InvalidArgument(format!(
                    "hklin {} does not exist",
                    hklin.display()
                )));
            }
        }
        Ok(())
    }

    pub fn check_hklout(&self) -> Result<()> {
        let hklout = self
            .hklout
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("hklout not defined".into()))?;
        if self.hklin.iter().any(|h| h == hklout) {
            return Err(Error::InvalidArgument(format!(
                "hklout and hklin are the same file ({})",
                hklout.display()
            )));
        }
        Ok(())
    }

    pub fn input(&mut self, record: &str) -> Result<()> {
        self.driver.input(record)
    }

    /// Add the file keywords to the command line and start the program.
    pub fn start(&mut self) -> Result<()> {
        if let Some(scratch) = &self.scratch {
            std::fs::create_dir_all(scratch)?;
        }
        if !self.hklin.is_empty() {
            self.driver.add_command_line("hklin");
            for hklin in &self.hklin {
                self.driver.add_command_line(&hklin.display().to_string());
            }
        }
        let keywords = [
            ("hklout", &self.hklout),
            ("xyzin", &self.xyzin),
            ("xyzout", &self.xyzout),
            ("mapin", &self.mapin),
            ("mapout", &self.mapout),
        ];
        for (keyword, path) in keywords {
            if let Some(path) = path {
                self.driver.add_command_line(keyword);
                self.driver.add_command_line(&path.display().to_string());
            }
        }
        self.driver.start()
    }

    /// Wait for the program and collect its loggraph tables.
    pub fn close_wait(&mut self) -> Result<()> {
        self.driver.close_wait()?;
        self.loggraphs = parse_loggraph(self.driver.get_all_output()?)?;
        Ok(())
    }

    pub fn get_all_output(&self) -> Result<&[String]> {
        self.driver.get_all_output()
    }

    pub fn loggraphs(&self) -> &IndexMap<String, LogGraph> {
        &self.loggraphs
    }

    /// Generic driver checks followed by CCP4 library signals.
    pub fn check_for_errors(&self) -> Result<()> {
        self.driver.check_for_errors()?;
        self.check_ccp4_errors()
    }

    fn check_ccp4_errors(&self) -> Result<()> {
        let output = self.driver.get_all_output()?;
        for line in output {
            if !line.contains("CCP4 library signal") {
                continue;
            }
            let error = line
                .split(':')
                .nth(1)
                .unwrap_or_default()
                .split('(')
                .next()
                .unwrap_or_default()
                .trim()
                .to_string();
            let message = if error.contains("Write failed") {
                output
                    .iter()
                    .find(|l| l.contains(">>>>>> System signal"))
                    .and_then(|l| l.split(':').nth(1))
                    .map(|cause| format!("{error}:{}", cause.split('(').next().unwrap_or_default()))
                    .unwrap_or(error)
            } else {
                error
            };
            return Err(ToolError::Failed {
                program: self.driver.executable().to_string(),
                message,
                hint: None,
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::helper::ExitOutcome;
    use crate::driver::DriverCommon;

    /// Replays fixed output without running anything.
    struct Replay {
        common: DriverCommon,
        output: Vec<String>,
    }

    impl Replay {
        fn new(output: &[&str]) -> Self {
            let dir = std::env::temp_dir();
            let mut common = DriverCommon::new("aimless", PathBuf::from("/opt/ccp4/bin/aimless"));
            common.working_directory = dir;
            common.name = crate::driver::helper::random_name();
            Self {
                common,
                output: output.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    impl Driver for Replay {
        fn common(&self) -> &DriverCommon {
            &self.common
        }

        fn common_mut(&mut self) -> &mut DriverCommon {
            &mut self.common
        }

        fn start(&mut self) -> Result<()> {
            self.common.mark_started();
            Ok(())
        }

        fn close_wait(&mut self) -> Result<()> {
            let output = self.output.clone();
            self.common.mark_finished(output, ExitOutcome::success())
        }
    }

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_string).collect()
    }

    #[test]
    fn test_parse_loggraph() {
        let output = lines(
            "header\n\
             $TABLE:  Analysis against Batch:\n\
             $GRAPHS: Rmerge v Batch:N:1,3: $$\n\
             N Batch Rmerge $$\n\
             $$\n\
             1 1 0.031\n\
             2 2 0.035\n\
             broken row\n\
             $$\n\
             trailer",
        );
        let tables = parse_loggraph(&output).unwrap();
        let table = &tables["Analysis against Batch"];
        assert_eq!(table.columns, ["N", "Batch", "Rmerge"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.column("Rmerge"), vec![0.031, 0.035]);
        assert!(table.column("missing").is_empty());
    }

    #[test]
    fn test_broken_loggraph() {
        let output = lines("$TABLE: truncated:\n$GRAPHS: x $$\nA B $$");
        assert!(parse_loggraph(&output).is_err());
    }

    #[test]
    fn test_file_checks() {
        let dir = tempfile::tempdir().unwrap();
        let mut ccp4 = Ccp4Capability::new(Box::new(Replay::new(&[])), None, None);
        assert_eq!(ccp4.check_hklin().unwrap_err().to_string(), "invalid argument: hklin not defined");

        let hklin = dir.path().join("in.mtz");
        ccp4.set_hklin(&hklin);
        assert!(ccp4.check_hklin().unwrap_err().to_string().contains("does not exist"));
        std::fs::write(&hklin, "").unwrap();
        assert!(ccp4.check_hklin().is_ok());

        ccp4.set_hklout(&hklin);
        assert!(ccp4.check_hklout().unwrap_err().to_string().contains("same file"));
        ccp4.set_hklout(dir.path().join("out.mtz"));
        assert!(ccp4.check_hklout().is_ok());
    }

    #[test]
    fn test_start_adds_keywords_and_library_path() {
        let mut ccp4 = Ccp4Capability::new(Box::new(Replay::new(&[])), Some("/opt/ccp4/lib"), None);
        ccp4.set_hklin("/data/in.mtz");
        ccp4.set_hklout("/data/out.mtz");
        ccp4.start().unwrap();

        let common = ccp4.driver().common();
        assert_eq!(
            common.command_line,
            ["hklin", "/data/in.mtz", "hklout", "/data/out.mtz"]
        );
        let variable = if cfg!(target_os = "macos") {
            "DYLD_LIBRARY_PATH"
        } else {
            "LD_LIBRARY_PATH"
        };
        assert_eq!(common.environment[variable], ["/opt/ccp4/lib"]);
    }

    #[test]
    fn test_library_signal() {
        let mut ccp4 = Ccp4Capability::new(
            Box::new(Replay::new(&[
                ">>>>>> CCP4 library signal mtz:Read failed (Error)",
                " raised in MtzGet <<<<<<",
            ])),
            None,
            None,
        );
        ccp4.start().unwrap();
        ccp4.close_wait().unwrap();
        let err = ccp4.check_for_errors().unwrap_err();
        assert_eq!(err.to_string(), "Read failed");
    }
}
