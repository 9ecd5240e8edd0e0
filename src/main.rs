use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use chrono::{Datelike, Local, NaiveDate};
use clap::{CommandFactory, Parser, Subcommand};
use comfy_table::{Attribute, Cell, Color, Table};
use inquire::{Confirm, CustomType, InquireError, Select, Text};
use rust_decimal::Decimal;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use cycle_billing::artifact::BucketArtifactStore;
use cycle_billing::backend::SupabaseClient;
use cycle_billing::calc::{self, format_currency, format_percent};
use cycle_billing::chat::{ChatService, SenderType, SessionStatus};
use cycle_billing::config::{self, AppSettings, ShopConfig, load_settings, save_settings, template_override_path};
use cycle_billing::dashboard::{month_stats, recent_bills, today_stats, top_products};
use cycle_billing::desktop::{self, DesktopShareTarget, open_and_reveal};
use cycle_billing::draft::BillDraft;
use cycle_billing::error::{Notice, error_chain};
use cycle_billing::model::Bill;
use cycle_billing::render::{DefaultImageLoader, DocumentRenderer, InvoiceView, TypstEngine};
use cycle_billing::repository::BillRepository;
use cycle_billing::share::{ShareDispatcher, ShareOutcome};
use cycle_billing::state_store::FileStateStore;

// ==========================================
// Constants
// ==========================================
const ACTION_SAVE: &str = "💾 Save PDF";
const ACTION_PRINT: &str = "🖨  Print";
const ACTION_SHARE: &str = "📲 Share on WhatsApp";
const ACTION_DONE: &str = "✅ Done";

const GREEN: Color = Color::Rgb { r: 4, g: 120, b: 87 };
const RED: Color = Color::Rgb { r: 185, g: 28, b: 28 };

type Renderer = DocumentRenderer<TypstEngine, DefaultImageLoader>;

// ==========================================
// Structs & Enums
// ==========================================

#[derive(Parser)]
#[command(name = "cycle-billing", version, about = "Bills and invoices for the shop counter")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new bill
    New,
    /// Share a saved bill on WhatsApp
    Share,
    /// Print a saved bill
    Print,
    /// List recent bills
    Bills {
        /// How many bills to show
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// Show today's and this month's figures
    Summary {
        /// Month to summarize as YYYY-MM (defaults to the current month)
        month: Option<String>,
    },
    /// Answer live chat sessions
    Chat,
    /// Open output folder
    Open,
    /// Configure data directory
    Config,
}

struct App {
    root: PathBuf,
    config: ShopConfig,
    renderer: Arc<Renderer>,
}

// ==========================================
// Main Function
// ==========================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cycle_billing=info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    if let Commands::Config = command {
        setup_config_wizard()?;
        return Ok(());
    }

    let settings = match load_settings() {
        Some(settings) => settings,
        None => setup_config_wizard()?,
    };
    let app = App::load(settings.root())?;

    match command {
        Commands::New => new_bill(&app).await?,
        Commands::Share => share_saved_bill(&app).await?,
        Commands::Print => print_saved_bill(&app).await?,
        Commands::Bills { limit } => list_bills(&app, limit).await?,
        Commands::Summary { month } => show_summary(&app, month.as_deref()).await?,
        Commands::Chat => chat_inbox(&app).await?,
        Commands::Open => open_folder_wizard(&app.root)?,
        Commands::Config => {}
    }
    Ok(())
}

impl App {
    fn load(root: PathBuf) -> anyhow::Result<Self> {
        let config = ShopConfig::load(&root)?;
        let images = DefaultImageLoader::new(config.image_timeout()).context("building image client")?;
        let renderer = DocumentRenderer::new(TypstEngine::default(), images)?
            .with_image_timeout(config.image_timeout())
            .with_template_override(&template_override_path(&root))?;
        Ok(Self { root, config, renderer: Arc::new(renderer) })
    }

    fn gst_rate(&self) -> Decimal {
        self.config.billing.gst_rate
    }

    /// The hosted backend, or the notice explaining why there is none.
    fn backend(&self) -> Result<SupabaseClient, Notice> {
        let backend = &self.config.backend;
        SupabaseClient::new(&backend.url, &backend.anon_key, self.config.backend_timeout())
            .map_err(|err| Notice::from_error("Backend not configured", &err))
    }

    fn dispatcher(
        &self,
        client: SupabaseClient,
    ) -> ShareDispatcher<Arc<Renderer>, BucketArtifactStore<SupabaseClient>, DesktopShareTarget> {
        let artifacts = BucketArtifactStore::new(client, self.config.backend.bucket.clone());
        ShareDispatcher::new(self.renderer.clone(), artifacts, DesktopShareTarget)
            .with_country_code(self.config.billing.country_code.clone())
            .with_timeouts(self.config.share_timeouts())
    }
}

// ==========================================
// 1. Prompt & Output Helpers
// ==========================================

/// `None` when the operator pressed Esc or Ctrl-C.
fn answered<T>(result: Result<T, InquireError>) -> anyhow::Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(InquireError::OperationCanceled | InquireError::OperationInterrupted) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn print_notice(notice: &Notice) {
    println!("❌ {}", notice.title);
    if !notice.detail.is_empty() {
        println!("   {}", notice.detail);
    }
}

fn money_cell(amount: Decimal) -> Cell {
    Cell::new(format_currency(amount))
}

// ==========================================
// 2. Bill Entry
// ==========================================

async fn new_bill(app: &App) -> anyhow::Result<()> {
    let mut draft = BillDraft::new();

    println!("\n--- Customer Details ---");
    let Some(name) = answered(Text::new("Customer Name:").prompt())? else { return Ok(()) };
    let Some(phone) = answered(Text::new("Phone Number:").prompt())? else { return Ok(()) };
    let Some(address) = answered(Text::new("Address (Optional):").prompt())? else { return Ok(()) };
    draft.customer.name = name.trim().to_string();
    draft.customer.phone = phone.trim().to_string();
    draft.customer.address = address.trim().to_string();

    if !enter_items(&mut draft)? {
        println!("Cancelled");
        return Ok(());
    }

    let gst_label = format!("Include GST ({}%)?", format_percent(app.gst_rate()));
    let Some(include_gst) = answered(Confirm::new(&gst_label).with_default(false).prompt())? else {
        return Ok(());
    };
    draft.include_gst = include_gst;

    if let Err(missing) = draft.validate_for_generation() {
        print_notice(&Notice::new("Missing Information", missing.0));
        return Ok(());
    }
    print_draft(&draft, app.gst_rate());

    let bill_number = calc::bill_number();
    let today = Local::now().date_naive();
    let view = InvoiceView::from_draft(&app.config.shop, &draft, &bill_number, today, app.gst_rate());

    let client = match app.backend() {
        Ok(client) => {
            let repository = BillRepository::new(client.clone());
            match repository.save_bill(&draft.to_new_bill(&bill_number, app.gst_rate()), draft.items()).await {
                Ok(bill) => println!("✅ Bill #{} saved", bill.bill_number),
                Err(err) => print_notice(&err.notice()),
            }
            Some(client)
        }
        Err(notice) => {
            print_notice(&notice);
            println!("   The bill is not recorded, but the PDF can still be produced.");
            None
        }
    };

    invoice_actions(app, &view, client).await
}

/// Fills the draft row by row. Returns false when the operator cancelled.
fn enter_items(draft: &mut BillDraft) -> anyhow::Result<bool> {
    println!("\n--- Items ---");
    println!("(Leave Item Name empty to finish)");

    let mut blank_row = draft.items().first().map(|item| item.id());
    loop {
        let Some(name) = answered(Text::new("Item Name:").prompt())? else { return Ok(false) };
        if name.trim().is_empty() {
            return Ok(true);
        }
        let Some(quantity) = answered(
            CustomType::<u32>::new("Quantity:")
                .with_default(1)
                .with_error_message("Please type a whole number")
                .prompt(),
        )?
        else {
            return Ok(false);
        };
        let Some(rate) = answered(
            CustomType::<Decimal>::new("Rate (₹):")
                .with_error_message("Please type an amount, e.g. 150 or 99.50")
                .prompt(),
        )?
        else {
            return Ok(false);
        };

        let id = blank_row.take().unwrap_or_else(|| draft.add_item());
        draft.set_name(id, name.trim());
        draft.set_quantity(id, quantity);
        draft.set_rate(id, rate);
    }
}

fn print_draft(draft: &BillDraft, gst_rate: Decimal) {
    let mut table = Table::new();
    table.set_header(vec![
        Cell::new("#"),
        Cell::new("Item"),
        Cell::new("Qty"),
        Cell::new("Rate"),
        Cell::new("Amount"),
    ]);
    for (index, item) in draft.named_items().iter().enumerate() {
        table.add_row(vec![
            Cell::new(index + 1),
            Cell::new(item.name()),
            Cell::new(item.quantity()),
            money_cell(item.rate()),
            money_cell(item.amount()),
        ]);
    }

    let totals = draft.totals(gst_rate);
    table.add_row(vec![
        Cell::new(""),
        Cell::new("Subtotal"),
        Cell::new(""),
        Cell::new(""),
        money_cell(totals.subtotal),
    ]);
    if draft.include_gst {
        let label = format!("GST ({}%)", format_percent(gst_rate));
        table.add_row(vec![Cell::new(""), Cell::new(label), Cell::new(""), Cell::new(""), money_cell(totals.tax)]);
    }
    table.add_row(vec![
        Cell::new(""),
        Cell::new("Total").add_attribute(Attribute::Bold),
        Cell::new(""),
        Cell::new(""),
        money_cell(totals.grand_total).add_attribute(Attribute::Bold),
    ]);

    println!("\n--- Bill for {} ---", draft.customer.name);
    println!("{table}");
}

// ==========================================
// 3. Invoice Actions (Save / Print / Share)
// ==========================================

async fn invoice_actions(app: &App, view: &InvoiceView, client: Option<SupabaseClient>) -> anyhow::Result<()> {
    let dispatcher = client.map(|client| app.dispatcher(client));
    loop {
        let mut options = vec![ACTION_SAVE, ACTION_PRINT];
        if dispatcher.is_some() {
            options.push(ACTION_SHARE);
        }
        options.push(ACTION_DONE);

        let Some(choice) = answered(Select::new("What next?", options).prompt())? else { return Ok(()) };
        match choice {
            ACTION_SAVE => save_pdf(app, view).await,
            ACTION_PRINT => print_pdf(app, view).await,
            ACTION_SHARE => {
                if let Some(dispatcher) = &dispatcher {
                    share_with_retry(dispatcher, view).await?;
                }
            }
            _ => return Ok(()),
        }
    }
}

async fn save_pdf(app: &App, view: &InvoiceView) {
    let dir = config::output_dir(&app.root, view.date.year(), &view.customer.name);
    println!("\n🔨 Generating PDF...");
    match app.renderer.save(view, &dir).await {
        Ok(path) => {
            println!("✅ PDF Generated: {}", path.display());
            open_and_reveal(&path);
        }
        Err(err) => print_notice(&Notice::from_error("Could not generate PDF", &err)),
    }
}

async fn print_pdf(app: &App, view: &InvoiceView) {
    let spool = std::env::temp_dir().join("cycle-billing");
    println!("\n🖨  Sending to printer...");
    match app.renderer.print(view, &spool).await {
        Ok(path) => debug!(path = %path.display(), "print job submitted"),
        Err(err) => print_notice(&Notice::from_error("Could not print", &err)),
    }
}

/// Runs the share and offers a retry on failure. A retry reuses the document
/// that was already rendered.
async fn share_with_retry(
    dispatcher: &ShareDispatcher<Arc<Renderer>, BucketArtifactStore<SupabaseClient>, DesktopShareTarget>,
    view: &InvoiceView,
) -> anyhow::Result<()> {
    loop {
        println!("\n📲 Preparing WhatsApp share...");
        let report = dispatcher.share(view).await;
        debug!(transitions = ?report.transitions, "share finished");
        match &report.result {
            Ok(ShareOutcome::LinkOpened { document_url, .. }) => {
                println!("✅ Opening WhatsApp...");
                println!("   {document_url}");
                return Ok(());
            }
            Ok(ShareOutcome::Shared) => {
                println!("✅ Shared");
                return Ok(());
            }
            Ok(ShareOutcome::Cancelled) => return Ok(()),
            Err(_) => {
                if let Some(notice) = report.notice() {
                    print_notice(&notice);
                }
                let retry = answered(Confirm::new("Try again?").with_default(true).prompt())?;
                if retry != Some(true) {
                    return Ok(());
                }
            }
        }
    }
}

// ==========================================
// 4. Saved Bills
// ==========================================

async fn load_bills(app: &App) -> anyhow::Result<Option<(SupabaseClient, Vec<Bill>)>> {
    let client = match app.backend() {
        Ok(client) => client,
        Err(notice) => {
            print_notice(&notice);
            return Ok(None);
        }
    };
    match BillRepository::new(client.clone()).list_bills().await {
        Ok(bills) => Ok(Some((client, bills))),
        Err(err) => {
            print_notice(&Notice::from_error("Could not load bills", &err));
            Ok(None)
        }
    }
}

fn bill_label(bill: &Bill) -> String {
    format!(
        "#{} | {} | {} | {}",
        bill.bill_number,
        bill.customer_name,
        format_currency(bill.total_amount),
        bill.created_at.with_timezone(&Local).format("%d/%m/%Y")
    )
}

fn select_bill(bills: Vec<Bill>, prompt: &str) -> anyhow::Result<Option<Bill>> {
    if bills.is_empty() {
        println!("❌ No bills found.");
        return Ok(None);
    }
    let labels: Vec<String> = bills.iter().map(bill_label).collect();
    let Some(choice) = answered(Select::new(prompt, labels.clone()).with_page_size(10).prompt())? else {
        return Ok(None);
    };
    Ok(labels.iter().position(|label| *label == choice).and_then(|index| bills.into_iter().nth(index)))
}

async fn share_saved_bill(app: &App) -> anyhow::Result<()> {
    let Some((client, bills)) = load_bills(app).await? else { return Ok(()) };
    let Some(bill) = select_bill(bills, "Select Bill to Share (Type to Filter):")? else { return Ok(()) };
    let view = InvoiceView::from_bill(&app.config.shop, &bill, app.gst_rate());
    share_with_retry(&app.dispatcher(client), &view).await
}

async fn print_saved_bill(app: &App) -> anyhow::Result<()> {
    let Some((_, bills)) = load_bills(app).await? else { return Ok(()) };
    let Some(bill) = select_bill(bills, "Select Bill to Print (Type to Filter):")? else { return Ok(()) };
    let view = InvoiceView::from_bill(&app.config.shop, &bill, app.gst_rate());
    print_pdf(app, &view).await;
    Ok(())
}

async fn list_bills(app: &App, limit: usize) -> anyhow::Result<()> {
    let Some((_, bills)) = load_bills(app).await? else { return Ok(()) };
    let recent = recent_bills(&bills, limit, Local::now());
    if recent.is_empty() {
        println!("(None found)");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec![Cell::new("Bill"), Cell::new("Customer"), Cell::new("Amount"), Cell::new("When")]);
    for bill in recent {
        table.add_row(vec![
            Cell::new(format!("#{}", bill.bill_number)),
            Cell::new(bill.customer),
            money_cell(bill.amount),
            Cell::new(bill.when),
        ]);
    }
    println!("\n--- Recent Bills ---");
    println!("{table}");
    Ok(())
}

// ==========================================
// 5. Summary
// ==========================================

fn parse_month(month: &str) -> Option<(i32, u32)> {
    let date = NaiveDate::parse_from_str(&format!("{month}-01"), "%Y-%m-%d").ok()?;
    Some((date.year(), date.month()))
}

async fn show_summary(app: &App, month: Option<&str>) -> anyhow::Result<()> {
    let now = Local::now();
    let (year, month) = match month {
        Some(text) => match parse_month(text) {
            Some(ym) => ym,
            None => {
                print_notice(&Notice::new("Invalid month", format!("expected YYYY-MM, got {text}")));
                return Ok(());
            }
        },
        None => (now.year(), now.month()),
    };
    let Some((_, bills)) = load_bills(app).await? else { return Ok(()) };

    let today = today_stats(&bills, now.date_naive(), &Local);
    let mut day_table = Table::new();
    day_table.set_header(vec![
        Cell::new("Sales"),
        Cell::new("Orders"),
        Cell::new("Customers"),
        Cell::new("Avg. Order"),
    ]);
    let sales_cell = money_cell(today.sales).add_attribute(Attribute::Bold);
    day_table.add_row(vec![
        if today.sales > Decimal::ZERO { sales_cell.fg(GREEN) } else { sales_cell },
        Cell::new(today.orders),
        Cell::new(today.customers),
        money_cell(today.avg_order_value),
    ]);
    println!("\n--- Today ({}) ---", now.format("%d/%m/%Y"));
    println!("{day_table}");

    let stats = month_stats(&bills, year, month, &Local);
    let month_label = NaiveDate::from_ymd_opt(year, month, 1)
        .map_or_else(String::new, |d| d.format("%B %Y").to_string());
    let mut month_table = Table::new();
    month_table.set_header(vec![Cell::new("Sales"), Cell::new("Orders"), Cell::new("Customers")]);
    let sales_cell = money_cell(stats.sales).add_attribute(Attribute::Bold);
    month_table.add_row(vec![
        if stats.orders == 0 { sales_cell.fg(RED) } else { sales_cell.fg(GREEN) },
        Cell::new(stats.orders),
        Cell::new(stats.customers),
    ]);
    println!("\n--- {month_label} ---");
    println!("{month_table}");

    let products = top_products(&bills, 5);
    if !products.is_empty() {
        let mut product_table = Table::new();
        product_table.set_header(vec![Cell::new("Item"), Cell::new("Units"), Cell::new("Revenue")]);
        for product in products {
            product_table.add_row(vec![
                Cell::new(product.name),
                Cell::new(product.units),
                money_cell(product.revenue),
            ]);
        }
        println!("\n--- Top Items ---");
        println!("{product_table}");
    }
    Ok(())
}

// ==========================================
// 6. Live Chat Inbox
// ==========================================

async fn chat_inbox(app: &App) -> anyhow::Result<()> {
    let client = match app.backend() {
        Ok(client) => client,
        Err(notice) => {
            print_notice(&notice);
            return Ok(());
        }
    };
    let state = FileStateStore::open(config::state_file_path())?;
    let chat = ChatService::new(client, state);

    let sessions = match chat.open_sessions().await {
        Ok(sessions) => sessions,
        Err(err) => {
            print_notice(&Notice::from_error("Could not load chats", &err));
            return Ok(());
        }
    };
    if sessions.is_empty() {
        println!("💬 No open chats.");
        return Ok(());
    }

    let labels: Vec<String> = sessions
        .iter()
        .map(|s| {
            let opened = s.created_at.with_timezone(&Local).format("%d/%m %H:%M");
            format!("{} | {} | {}", s.guest_label(), s.status.as_str(), opened)
        })
        .collect();
    let Some(choice) = answered(Select::new("Select Chat:", labels.clone()).prompt())? else { return Ok(()) };
    let Some(session) = labels.iter().position(|l| *l == choice).and_then(|i| sessions.get(i)) else {
        return Ok(());
    };

    let (session, transcript) = match chat.open_session(session.id).await {
        Ok(opened) => opened,
        Err(err) => {
            print_notice(&Notice::from_error("Could not open chat", &err));
            return Ok(());
        }
    };

    println!("\n--- Chat with guest {} ---", session.guest_label());
    for message in transcript.messages() {
        let who = match message.sender_type {
            SenderType::User => "Guest",
            SenderType::Admin => "Shop",
        };
        println!("[{}] {who}: {}", message.created_at.with_timezone(&Local).format("%H:%M"), message.content);
    }

    println!("(Leave empty to stop replying)");
    loop {
        let Some(reply) = answered(Text::new("Reply:").prompt())? else { break };
        if reply.trim().is_empty() {
            break;
        }
        if let Err(err) = chat.reply(session.id, &reply).await {
            print_notice(&Notice::from_error("Could not send reply", &err));
        }
    }

    let close = answered(Confirm::new("Close this chat?").with_default(false).prompt())?;
    if close == Some(true) {
        match chat.set_status(session.id, SessionStatus::Closed).await {
            Ok(_) => println!("✅ Chat closed."),
            Err(err) => print_notice(&Notice::from_error("Could not close chat", &err)),
        }
    }
    Ok(())
}

// ==========================================
// 7. Open Folder
// ==========================================

fn open_folder_wizard(root: &Path) -> anyhow::Result<()> {
    let output_root = root.join("output");
    let root_opt = "📂 Open Root Output Directory".to_string();

    let mut customer_dirs = Vec::new();
    if let Ok(years) = fs::read_dir(&output_root) {
        for year in years.flatten().filter(|e| e.path().is_dir()) {
            let year_name = year.file_name().to_string_lossy().to_string();
            if let Ok(customers) = fs::read_dir(year.path()) {
                for customer in customers.flatten().filter(|e| e.path().is_dir()) {
                    customer_dirs.push(format!("{} / {}", year_name, customer.file_name().to_string_lossy()));
                }
            }
        }
    }
    customer_dirs.sort();
    customer_dirs.reverse();

    let mut options = vec![root_opt.clone()];
    options.extend(customer_dirs);

    let Some(choice) = answered(Select::new("Select Folder to Open:", options).prompt())? else {
        println!("Operation cancelled.");
        return Ok(());
    };
    let target = match choice.split_once(" / ") {
        Some((year, customer)) if choice != root_opt => output_root.join(year).join(customer),
        _ => output_root,
    };
    fs::create_dir_all(&target).with_context(|| format!("creating {}", target.display()))?;
    println!("🚀 Opening: {}", target.display());
    if let Err(err) = desktop::open_url(&target.to_string_lossy()) {
        warn!(error = %error_chain(&err), "could not open folder");
    }
    Ok(())
}

// ==========================================
// 8. Config
// ==========================================

fn setup_config_wizard() -> anyhow::Result<AppSettings> {
    println!("\n⚙️  --- Configuration Setup ---");
    let default_root = load_settings().unwrap_or_default().data_root;

    println!("📂 Opening folder picker...");
    let picked = rfd::FileDialog::new().set_title("Select Root Data Directory").pick_folder();

    let data_root = match picked {
        Some(path) => path.to_string_lossy().to_string(),
        None => {
            println!("❌ No folder selected. Falling back to manual input.");
            Text::new("Enter Root Data Directory:").with_default(&default_root).prompt()?
        }
    };

    let settings = AppSettings { data_root };
    let path = save_settings(&settings)?;
    ShopConfig::load(&settings.root())?;
    println!("✅ Settings saved to {}", path.display());
    println!("   Shop details: {}", settings.root().join("shop.toml").display());
    Ok(settings)
}
