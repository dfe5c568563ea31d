use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use hepcast_core::{run_pipeline, PipelineConfig};
use hepcast_records::{
    anonymize_patient_csv, clean_records, forecast_rolling_errors, load_records_csv,
    load_records_json, read_monthly_forecast_csv, write_forecast_csv, write_forecast_rows,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "hepcast",
    about = "Dự báo số ca viêm gan B theo tháng từ dữ liệu đăng ký bệnh nhân."
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Huấn luyện mọi mô hình, chọn mô hình tốt nhất và xuất dự báo.
    Run {
        /// Bản ghi bệnh nhân dạng CSV, hoặc mảng JSON nếu file có đuôi `.json`.
        #[arg(short, long)]
        input: PathBuf,
        /// File JSON cấu hình pipeline; trường thiếu dùng giá trị mặc định.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Số tháng dự báo, ghi đè cấu hình.
        #[arg(long)]
        horizon: Option<usize>,
        #[arg(short, long, default_value = ".")]
        out_dir: PathBuf,
    },
    /// Chuẩn hoá CSV dự báo và tính sai số trượt so với số liệu thực tế.
    ///
    /// Tên cột được tự nhận diện; dòng có ngày không đọc được sẽ bị bỏ qua.
    ValidateForecast {
        #[arg(short, long)]
        input: PathBuf,
        /// Nơi ghi CSV đã chuẩn hoá.
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long, default_value_t = 7)]
        window: usize,
    },
    /// Xoá các cột PHI và băm mã bệnh nhân.
    Anonymize {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    match Args::parse().command {
        Command::Run {
            input,
            config,
            horizon,
            out_dir,
        } => run(&input, config.as_deref(), horizon, &out_dir),
        Command::ValidateForecast {
            input,
            output,
            window,
        } => validate_forecast(&input, output.as_deref(), window),
        Command::Anonymize { input, output } => anonymize(&input, &output),
    }
}

fn run(
    input: &Path,
    config: Option<&Path>,
    horizon: Option<usize>,
    out_dir: &Path,
) -> anyhow::Result<()> {
    let mut config = match config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Không đọc được config {path:?}"))?;
            serde_json::from_str::<PipelineConfig>(&text)
                .with_context(|| format!("Config không hợp lệ {path:?}"))?
        }
        None => PipelineConfig::default(),
    };
    if let Some(horizon) = horizon {
        config.horizon = horizon;
    }

    let is_json = input
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let raw = if is_json {
        let text = fs::read_to_string(input)
            .with_context(|| format!("Không đọc được file {input:?}"))?;
        load_records_json(&text)?
    } else {
        let file = File::open(input).with_context(|| format!("Không mở được file {input:?}"))?;
        load_records_csv(BufReader::new(file))?
    };
    let records = clean_records(&raw, config.imputation)
        .with_context(|| format!("Không làm sạch được dữ liệu từ {input:?}"))?;
    let report = run_pipeline(&records, &config)?;

    fs::create_dir_all(out_dir)
        .with_context(|| format!("Không tạo được thư mục {out_dir:?}"))?;
    let forecast_path = out_dir.join("forecast.csv");
    let file = File::create(&forecast_path)
        .with_context(|| format!("Không tạo được {forecast_path:?}"))?;
    write_forecast_csv(BufWriter::new(file), &report.forecast)?;
    write_json(&out_dir.join("metrics.json"), &report.metric_samples())?;
    write_json(&out_dir.join("report.json"), &report)?;
    tracing::info!(out_dir = %out_dir.display(), job_id = %report.job_id, "wrote forecast outputs");

    println!(
        "Job: {}\nSelected model: {}\nModels trained: {} ({} failed)\nForecast periods: {}",
        report.job_id,
        report.selected_model,
        report.models.len(),
        report.failures.len(),
        report.forecast.len()
    );
    for model in &report.models {
        println!(
            "  #{} {:<18} RMSE {:>8.3}  MAE {:>8.3}",
            model.rank, model.model, model.metrics.rmse, model.metrics.mae
        );
    }
    Ok(())
}

fn validate_forecast(input: &Path, output: Option<&Path>, window: usize) -> anyhow::Result<()> {
    let file = File::open(input).with_context(|| format!("Không mở được file {input:?}"))?;
    let rows = read_monthly_forecast_csv(BufReader::new(file))
        .with_context(|| format!("CSV dự báo không hợp lệ {input:?}"))?;

    if let Some(path) = output {
        let file = File::create(path).with_context(|| format!("Không tạo được {path:?}"))?;
        write_forecast_rows(BufWriter::new(file), &rows)?;
    }

    println!("Rows: {}", rows.len());
    if rows.iter().all(|row| row.actual.is_none()) {
        println!("No actuals to compare against.");
        return Ok(());
    }

    println!("date,predicted_median,actual,rolling_mae,rolling_rmse");
    let rolling = forecast_rolling_errors(&rows, window);
    for (row, error) in rows.iter().zip(&rolling) {
        println!(
            "{},{},{},{},{}",
            row.date,
            row.predicted_median,
            format_optional(row.actual),
            format_optional(error.mae),
            format_optional(error.rmse)
        );
    }
    Ok(())
}

fn anonymize(input: &Path, output: &Path) -> anyhow::Result<()> {
    let reader = File::open(input).with_context(|| format!("Không mở được file {input:?}"))?;
    let writer = File::create(output).with_context(|| format!("Không tạo được {output:?}"))?;
    let summary = anonymize_patient_csv(BufReader::new(reader), BufWriter::new(writer))?;
    println!(
        "Rows: {}\nBlanked columns: {}\nIdentifier hashed: {}",
        summary.rows,
        summary.blanked_columns.join(", "),
        summary.hashed_identifier
    );
    Ok(())
}

fn write_json<T: serde::Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| format!("Không tạo được {path:?}"))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)
        .with_context(|| format!("Không ghi được {path:?}"))?;
    writer
        .flush()
        .with_context(|| format!("Không flush được {path:?}"))
}

fn format_optional(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.3}")).unwrap_or_default()
}
