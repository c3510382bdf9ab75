use anyhow::{Context, Result};
use capito::config::Config;
use capito::{
    ColumnType, Criteria, Database, Locale, LocaleContext, LocaleDefaults, Model, Query,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("capito=info".parse()?),
        )
        .init();

    info!("Starting capito smoke run");

    let config = Config::from_env()?;
    let db = Database::from_config(&config)
        .await
        .context("Failed to open database")?;

    let products = Model::builder("products")
        .column("category_id", ColumnType::Integer)
        .column("permalink", ColumnType::Text)
        .column("hidden", ColumnType::Bool)
        .translates("title", ColumnType::Text)
        .build()?;
    db.create_tables(&products)
        .await
        .context("Failed to create product tables")?;

    let en = Locale::parse("en")?;
    let fr = Locale::parse("fr")?;
    let configured = config.locale_defaults();
    let defaults = LocaleDefaults::new(
        configured.locale().clone(),
        configured.available_locales().iter().cloned().chain([en.clone(), fr.clone()]),
    );
    let mut ctx = LocaleContext::new(defaults);

    // Step 1: Create a product translated into two locales
    let mut product = products.new_record();
    ctx.with_locale(en.clone(), |ctx| product.set("title", "Widget", ctx))?;
    ctx.with_locale(fr.clone(), |ctx| product.set("title", "Gadget", ctx))?;
    product.set("permalink", "widget", &ctx)?;
    db.save(&mut product, &ctx).await?;
    info!(
        "Saved product {:?} in {} locale(s)",
        product.id(),
        product.translated_locales().len()
    );

    // Step 2: Query by translated title in each locale
    let en_ctx = ctx.scoped(en.clone());
    let found = Query::new(products.clone(), &en_ctx)
        .find_by(Criteria::new().eq("title", "Widget"), &db)
        .await?;
    info!("Lookup of 'Widget' in en: {:?}", found.as_ref().and_then(|p| p.id()));

    let fr_ctx = ctx.scoped(fr.clone());
    let missing = Query::new(products.clone(), &fr_ctx)
        .find_by(Criteria::new().eq("title", "Widget"), &db)
        .await?;
    info!("Lookup of 'Widget' in fr: {:?}", missing.as_ref().and_then(|p| p.id()));

    // Step 3: Remove translations until the product goes away
    db.destroy_translation(&mut product, &fr).await?;
    info!("Remaining locales: {:?}", product.translated_locales());
    db.destroy_translation(&mut product, &en).await?;
    info!("Product destroyed with its last translation: {}", product.is_destroyed());

    Ok(())
}
