mod reload;
mod vmservice_control;
