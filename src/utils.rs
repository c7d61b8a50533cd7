use indicatif::ProgressStyle;

/// Style of the bar spanning a whole build.
pub(crate) fn style_build() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

/// Style of a single running work item, a spinner with no progress.
pub(crate) fn style_task() -> ProgressStyle {
    ProgressStyle::with_template("  {spinner:.blue} {msg} {elapsed:.dim}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}
