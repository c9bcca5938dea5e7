use as_result::IntoResult;
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::{fs::copy, process::Command};

/// Reads one kernel state variable via sysctl(8).
pub async fn sysctl(name: &str) -> io::Result<String> {
    let output = Command::new("sysctl").args(&["-n", name]).output().await?;
    output.status.into_result()?;

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}

pub async fn cp(src: &Path, dst: &Path) -> io::Result<u64> {
    copy(src, dst).await.map_err(|why| {
        io::Error::new(
            io::ErrorKind::Other,
            format!("failed to copy {:?} to {:?}: {}", src, dst, why),
        )
    })
}

pub fn format_error(source: &(dyn std::error::Error + 'static)) -> String {
    let mut out = fomat!((source));

    let mut source = source.source();
    while let Some(why) = source {
        out.push_str(&fomat!(": "(why)));
        source = why.source();
    }

    out
}

/// Re-roots an absolute path under `prefix`, so `/var/db/pkg` staged under
/// `/.snapup-stage` becomes `/.snapup-stage/var/db/pkg`.
pub fn prefixed<P: AsRef<Path>>(prefix: &Path, absolute: P) -> PathBuf {
    let absolute = absolute.as_ref();
    match absolute.strip_prefix("/") {
        Ok(relative) => prefix.join(relative),
        Err(_) => prefix.join(absolute),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_absolute() {
        assert_eq!(
            prefixed(Path::new("/.snapup-stage"), "/var/db/pkg"),
            PathBuf::from("/.snapup-stage/var/db/pkg")
        );
    }

    #[test]
    fn prefix_relative() {
        assert_eq!(prefixed(Path::new("/stage"), "etc/pkg"), PathBuf::from("/stage/etc/pkg"));
    }
}
